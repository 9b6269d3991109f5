//! Observation repository.
//!
//! Observations are created and updated exclusively by the consolidator,
//! never by direct user action. Evidence (the contributing fact ids) lives in
//! the `observation_facts` join table, indexed from both sides so
//! "which observations cite fact X" stays queryable.

use anyhow::{ensure, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use crate::embedding::EMBEDDING_DIM;
use crate::memory::types::Observation;
use crate::memory::{bytes_to_embedding, embedding_to_bytes};

const OBS_COLUMNS: &str =
    "id, summary, evidence_count, access_count, last_accessed, created_at, updated_at";

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: row.get(0)?,
        summary: row.get(1)?,
        evidence_count: row.get(2)?,
        access_count: row.get(3)?,
        last_accessed: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Insert a new observation with its evidence set. evidence_count equals the
/// cardinality of `fact_ids` at creation time (it may drift after later fact
/// deletions; accepted, not corrected).
pub fn insert_observation(
    conn: &mut Connection,
    summary: &str,
    embedding: &[f32],
    fact_ids: &[&str],
) -> Result<Observation> {
    let tx = conn.transaction()?;
    let obs = insert_observation_tx(&tx, summary, embedding, fact_ids)?;
    tx.commit()?;
    Ok(obs)
}

/// Statement body of [`insert_observation`], run inside the caller's
/// transaction. Lets the consolidator commit the observation and the source
/// fact's state change as one unit.
pub fn insert_observation_tx(
    conn: &Connection,
    summary: &str,
    embedding: &[f32],
    fact_ids: &[&str],
) -> Result<Observation> {
    ensure!(
        embedding.len() == EMBEDDING_DIM,
        "embedding has {} dimensions, expected {EMBEDDING_DIM}",
        embedding.len()
    );
    ensure!(!summary.trim().is_empty(), "observation summary must not be empty");

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO observations (id, summary, evidence_count, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id, summary, fact_ids.len() as i64, now],
    )?;
    let rowid = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO observations_fts (rowid, summary, id) VALUES (?1, ?2, ?3)",
        params![rowid, summary, id],
    )?;

    conn.execute(
        "INSERT INTO observations_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(embedding)],
    )?;

    {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO observation_facts (observation_id, fact_id) VALUES (?1, ?2)",
        )?;
        for fact_id in fact_ids {
            stmt.execute(params![id, fact_id])?;
        }
    }

    Ok(Observation {
        id,
        summary: summary.to_string(),
        evidence_count: fact_ids.len() as u32,
        access_count: 0,
        last_accessed: None,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Fold another fact into an existing observation: replace the summary and
/// embedding, add the evidence row, and recount evidence. Returns false if
/// the observation does not exist.
pub fn update_observation(
    conn: &mut Connection,
    observation_id: &str,
    new_summary: &str,
    embedding: &[f32],
    added_fact_id: &str,
) -> Result<bool> {
    let tx = conn.transaction()?;
    let updated = update_observation_tx(&tx, observation_id, new_summary, embedding, added_fact_id)?;
    tx.commit()?;
    Ok(updated)
}

/// Statement body of [`update_observation`], run inside the caller's
/// transaction.
pub fn update_observation_tx(
    conn: &Connection,
    observation_id: &str,
    new_summary: &str,
    embedding: &[f32],
    added_fact_id: &str,
) -> Result<bool> {
    ensure!(
        embedding.len() == EMBEDDING_DIM,
        "embedding has {} dimensions, expected {EMBEDDING_DIM}",
        embedding.len()
    );

    let old: Option<(i64, String)> = conn
        .query_row(
            "SELECT rowid, summary FROM observations WHERE id = ?1",
            params![observation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((rowid, old_summary)) = old else {
        return Ok(false);
    };

    conn.execute(
        "INSERT OR IGNORE INTO observation_facts (observation_id, fact_id) VALUES (?1, ?2)",
        params![observation_id, added_fact_id],
    )?;

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE observations SET summary = ?1, updated_at = ?2, \
         evidence_count = (SELECT COUNT(*) FROM observation_facts WHERE observation_id = ?3) \
         WHERE id = ?3",
        params![new_summary, now, observation_id],
    )?;

    conn.execute(
        "INSERT INTO observations_fts(observations_fts, rowid, summary, id) \
         VALUES('delete', ?1, ?2, ?3)",
        params![rowid, old_summary, observation_id],
    )?;
    conn.execute(
        "INSERT INTO observations_fts (rowid, summary, id) VALUES (?1, ?2, ?3)",
        params![rowid, new_summary, observation_id],
    )?;

    conn.execute(
        "DELETE FROM observations_vec WHERE id = ?1",
        params![observation_id],
    )?;
    conn.execute(
        "INSERT INTO observations_vec (id, embedding) VALUES (?1, ?2)",
        params![observation_id, embedding_to_bytes(embedding)],
    )?;

    Ok(true)
}

/// Fetch a single observation by id.
pub fn get_observation(conn: &Connection, observation_id: &str) -> Result<Option<Observation>> {
    let obs = conn
        .query_row(
            &format!("SELECT {OBS_COLUMNS} FROM observations WHERE id = ?1"),
            params![observation_id],
            observation_from_row,
        )
        .optional()?;
    Ok(obs)
}

/// Batch-fetch observations by id.
pub fn fetch_observations(
    conn: &Connection,
    ids: &[&str],
) -> Result<HashMap<String, Observation>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {OBS_COLUMNS} FROM observations WHERE id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let sql_params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let rows = stmt
        .query_map(sql_params.as_slice(), observation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().map(|o| (o.id.clone(), o)).collect())
}

/// Vector KNN over observation embeddings. Returns (id, L2 distance) pairs,
/// nearest first.
pub fn vector_search(
    conn: &Connection,
    embedding: &[f32],
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM observations_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// Read an observation's stored embedding, re-normalized to unit length.
pub fn get_embedding(conn: &Connection, observation_id: &str) -> Result<Option<Vec<f32>>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM observations_vec WHERE id = ?1",
            params![observation_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bytes.map(|b| bytes_to_embedding(&b)))
}

/// Fact ids contributing to an observation.
pub fn evidence(conn: &Connection, observation_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT fact_id FROM observation_facts WHERE observation_id = ?1 ORDER BY fact_id",
    )?;
    let rows = stmt
        .query_map(params![observation_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Observations citing a given fact.
pub fn citing_fact(conn: &Connection, fact_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT observation_id FROM observation_facts WHERE fact_id = ?1")?;
    let rows = stmt
        .query_map(params![fact_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Bump access_count and last_accessed for recalled observations. Missing ids
/// update zero rows, treated as success.
pub fn reinforce(conn: &Connection, ids: &[&str]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE observations SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![now, id])?;
    }
    Ok(())
}

/// Explicitly delete an observation and its evidence rows.
pub fn delete_observation(conn: &mut Connection, observation_id: &str) -> Result<bool> {
    let tx = conn.transaction()?;

    let row: Option<(i64, String)> = tx
        .query_row(
            "SELECT rowid, summary FROM observations WHERE id = ?1",
            params![observation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((rowid, summary)) = row else {
        return Ok(false);
    };

    tx.execute(
        "INSERT INTO observations_fts(observations_fts, rowid, summary, id) \
         VALUES('delete', ?1, ?2, ?3)",
        params![rowid, summary, observation_id],
    )?;
    tx.execute(
        "DELETE FROM observations_vec WHERE id = ?1",
        params![observation_id],
    )?;
    // Evidence rows cascade via FK
    tx.execute(
        "DELETE FROM observations WHERE id = ?1",
        params![observation_id],
    )?;

    tx.commit()?;
    Ok(true)
}
