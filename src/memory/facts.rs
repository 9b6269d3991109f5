//! Fact repository — stateless query builders over the storage engine.
//!
//! [`insert_fact`] is the single write entry point for new facts. It runs
//! inside a transaction: insert into the facts table, sync the FTS5 index,
//! insert the embedding vector. Facts are constructed in two phases: the
//! caller supplies base fields as a [`NewFact`], and the embedding is attached
//! at persist time, before the record becomes externally visible.

use anyhow::{ensure, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::str::FromStr;

use crate::embedding::EMBEDDING_DIM;
use crate::memory::types::{ConsolidationState, Fact, FactType};
use crate::memory::{bytes_to_embedding, embedding_to_bytes};

/// Base fields of a fact before persistence.
#[derive(Debug, Clone)]
pub struct NewFact {
    pub text: String,
    pub fact_type: FactType,
    pub source_type: String,
    pub source_ref: Option<String>,
}

/// Insert a new fact with its embedding. All operations run inside one
/// transaction. A wrong-dimension embedding is a programmer error and fails
/// immediately.
pub fn insert_fact(conn: &mut Connection, new: &NewFact, embedding: &[f32]) -> Result<Fact> {
    ensure!(
        embedding.len() == EMBEDDING_DIM,
        "embedding has {} dimensions, expected {EMBEDDING_DIM}",
        embedding.len()
    );
    ensure!(!new.text.trim().is_empty(), "fact text must not be empty");

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO facts (id, text, fact_type, source_type, source_ref, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            new.text,
            new.fact_type.as_str(),
            new.source_type,
            new.source_ref,
            now,
        ],
    )?;
    let rowid = tx.last_insert_rowid();

    // FTS5 external-content sync must use the same rowid
    tx.execute(
        "INSERT INTO facts_fts (rowid, text, id) VALUES (?1, ?2, ?3)",
        params![rowid, new.text, id],
    )?;

    tx.execute(
        "INSERT INTO facts_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(embedding)],
    )?;

    tx.commit()?;

    Ok(Fact {
        id,
        text: new.text.clone(),
        fact_type: new.fact_type,
        source_type: new.source_type.clone(),
        source_ref: new.source_ref.clone(),
        consolidation: ConsolidationState::Pending,
        consolidated_at: None,
        access_count: 0,
        last_accessed: None,
        created_at: now,
    })
}

const FACT_COLUMNS: &str = "id, text, fact_type, source_type, source_ref, consolidation, \
                            consolidated_at, access_count, last_accessed, created_at";

fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<Fact> {
    let fact_type: String = row.get(2)?;
    let consolidation: String = row.get(5)?;
    Ok(Fact {
        id: row.get(0)?,
        text: row.get(1)?,
        fact_type: FactType::from_str(&fact_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        source_type: row.get(3)?,
        source_ref: row.get(4)?,
        consolidation: ConsolidationState::from_str(&consolidation).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?,
        consolidated_at: row.get(6)?,
        access_count: row.get(7)?,
        last_accessed: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// Fetch a single fact by id.
pub fn get_fact(conn: &Connection, fact_id: &str) -> Result<Option<Fact>> {
    let fact = conn
        .query_row(
            &format!("SELECT {FACT_COLUMNS} FROM facts WHERE id = ?1"),
            params![fact_id],
            fact_from_row,
        )
        .optional()?;
    Ok(fact)
}

/// Batch-fetch facts by id.
pub fn fetch_facts(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, Fact>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {FACT_COLUMNS} FROM facts WHERE id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let sql_params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let rows = stmt
        .query_map(sql_params.as_slice(), fact_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().map(|f| (f.id.clone(), f)).collect())
}

/// Read a fact's stored embedding, re-normalized to unit length.
pub fn get_embedding(conn: &Connection, fact_id: &str) -> Result<Option<Vec<f32>>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM facts_vec WHERE id = ?1",
            params![fact_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bytes.map(|b| bytes_to_embedding(&b)))
}

/// Replace a fact's text and embedding (the `updateFact` edit path).
/// Returns false if the fact does not exist.
pub fn update_text(
    conn: &mut Connection,
    fact_id: &str,
    new_text: &str,
    embedding: &[f32],
) -> Result<bool> {
    ensure!(
        embedding.len() == EMBEDDING_DIM,
        "embedding has {} dimensions, expected {EMBEDDING_DIM}",
        embedding.len()
    );

    let tx = conn.transaction()?;

    let old: Option<(i64, String)> = tx
        .query_row(
            "SELECT rowid, text FROM facts WHERE id = ?1",
            params![fact_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((rowid, old_text)) = old else {
        return Ok(false);
    };

    tx.execute(
        "UPDATE facts SET text = ?1 WHERE id = ?2",
        params![new_text, fact_id],
    )?;

    // External-content FTS5 requires an explicit delete of the old row
    tx.execute(
        "INSERT INTO facts_fts(facts_fts, rowid, text, id) VALUES('delete', ?1, ?2, ?3)",
        params![rowid, old_text, fact_id],
    )?;
    tx.execute(
        "INSERT INTO facts_fts (rowid, text, id) VALUES (?1, ?2, ?3)",
        params![rowid, new_text, fact_id],
    )?;

    tx.execute("DELETE FROM facts_vec WHERE id = ?1", params![fact_id])?;
    tx.execute(
        "INSERT INTO facts_vec (id, embedding) VALUES (?1, ?2)",
        params![fact_id, embedding_to_bytes(embedding)],
    )?;

    tx.commit()?;
    Ok(true)
}

/// Bump access_count and last_accessed for recalled facts. Ids that no longer
/// exist (deleted between search and reinforcement) update zero rows, which is
/// treated as success.
pub fn reinforce(conn: &Connection, ids: &[&str]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE facts SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![now, id])?;
    }
    Ok(())
}

/// Delete a fact and its index rows. Entity refs and incident links go with
/// it via FK cascade. Returns false if the fact does not exist.
pub fn delete_fact(conn: &mut Connection, fact_id: &str) -> Result<bool> {
    let tx = conn.transaction()?;

    let row: Option<(i64, String)> = tx
        .query_row(
            "SELECT rowid, text FROM facts WHERE id = ?1",
            params![fact_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((rowid, text)) = row else {
        return Ok(false);
    };

    tx.execute(
        "INSERT INTO facts_fts(facts_fts, rowid, text, id) VALUES('delete', ?1, ?2, ?3)",
        params![rowid, text, fact_id],
    )?;
    tx.execute("DELETE FROM facts_vec WHERE id = ?1", params![fact_id])?;
    tx.execute("DELETE FROM facts WHERE id = ?1", params![fact_id])?;

    tx.commit()?;
    Ok(true)
}

/// Fetch the next batch of facts eligible for consolidation: pending facts,
/// plus skipped facts whose backoff has elapsed. Oldest first.
pub fn consolidation_batch(
    conn: &Connection,
    limit: usize,
    retry_backoff_secs: u64,
) -> Result<Vec<Fact>> {
    let retry_before =
        (chrono::Utc::now() - chrono::Duration::seconds(retry_backoff_secs as i64)).to_rfc3339();

    let mut stmt = conn.prepare(&format!(
        "SELECT {FACT_COLUMNS} FROM facts \
         WHERE consolidation = 'pending' \
            OR (consolidation = 'skipped' AND last_attempt_at < ?1) \
         ORDER BY created_at \
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![retry_before, limit as i64], fact_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Mark a fact as folded into an observation. Single statement, safe to run
/// as its own commit unit.
pub fn mark_consolidated(conn: &Connection, fact_id: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE facts SET consolidation = 'done', consolidated_at = ?1, last_attempt_at = ?1 \
         WHERE id = ?2",
        params![now, fact_id],
    )?;
    Ok(())
}

/// Mark a fact as skipped by the consolidator. Retried after the backoff.
pub fn mark_skipped(conn: &Connection, fact_id: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE facts SET consolidation = 'skipped', last_attempt_at = ?1 WHERE id = ?2",
        params![now, fact_id],
    )?;
    Ok(())
}

/// Wipe all facts, observations, entities, and derived rows.
pub fn clear_all(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "DELETE FROM fact_links;
         DELETE FROM entity_refs;
         DELETE FROM observation_facts;
         DELETE FROM entities_vec;
         DELETE FROM entities;
         DELETE FROM observations_vec;
         DELETE FROM observations_fts;
         DELETE FROM observations;
         DELETE FROM facts_vec;
         DELETE FROM facts_fts;
         DELETE FROM facts;",
    )?;
    tx.commit()?;
    Ok(())
}
