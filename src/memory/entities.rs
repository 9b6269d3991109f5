//! Entity and entity-ref repository.
//!
//! Entities are canonical named things; entity refs are per-fact mentions
//! pointing at them. The queries here also feed the resolver's scoring
//! signals (co-occurrence, temporal proximity) and the linker's IDF weights.

use anyhow::{ensure, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::embedding::EMBEDDING_DIM;
use crate::memory::embedding_to_bytes;
use crate::memory::types::{Entity, EntityRef};

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        name: row.get(1)?,
        entity_type: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Insert a new canonical entity with its name embedding.
pub fn insert_entity(
    conn: &mut Connection,
    name: &str,
    entity_type: &str,
    name_embedding: &[f32],
) -> Result<Entity> {
    ensure!(
        name_embedding.len() == EMBEDDING_DIM,
        "embedding has {} dimensions, expected {EMBEDDING_DIM}",
        name_embedding.len()
    );
    ensure!(!name.trim().is_empty(), "entity name must not be empty");

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO entities (id, name, entity_type, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, name, entity_type, now],
    )?;
    tx.execute(
        "INSERT INTO entities_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(name_embedding)],
    )?;
    tx.commit()?;

    Ok(Entity {
        id,
        name: name.to_string(),
        entity_type: entity_type.to_string(),
        created_at: now,
    })
}

/// Exact case-insensitive name match within a type. Ties broken by earliest
/// creation for deterministic resolution.
pub fn find_exact(conn: &Connection, name: &str, entity_type: &str) -> Result<Option<Entity>> {
    let entity = conn
        .query_row(
            "SELECT id, name, entity_type, created_at FROM entities \
             WHERE name = ?1 COLLATE NOCASE AND entity_type = ?2 \
             ORDER BY created_at LIMIT 1",
            params![name, entity_type],
            entity_from_row,
        )
        .optional()?;
    Ok(entity)
}

/// Fetch a single entity by id.
pub fn get_entity(conn: &Connection, entity_id: &str) -> Result<Option<Entity>> {
    let entity = conn
        .query_row(
            "SELECT id, name, entity_type, created_at FROM entities WHERE id = ?1",
            params![entity_id],
            entity_from_row,
        )
        .optional()?;
    Ok(entity)
}

/// Most recent entities of a given type, for resolver candidate gathering.
pub fn candidates_by_type(
    conn: &Connection,
    entity_type: &str,
    limit: usize,
) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, entity_type, created_at FROM entities \
         WHERE entity_type = ?1 ORDER BY created_at DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![entity_type, limit as i64], entity_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Nearest entities by name-embedding KNN. Returns (id, L2 distance).
pub fn candidates_by_vector(
    conn: &Connection,
    name_embedding: &[f32],
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM entities_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(
            params![embedding_to_bytes(name_embedding), limit as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// Record a mention of an entity inside a fact. The canonical id must point
/// at an existing entity when present (FK enforced).
pub fn insert_ref(
    conn: &Connection,
    fact_id: &str,
    name: &str,
    entity_type: &str,
    canonical_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_refs (fact_id, name, entity_type, canonical_id) \
         VALUES (?1, ?2, ?3, ?4)",
        params![fact_id, name, entity_type, canonical_id],
    )?;
    Ok(())
}

/// All mentions recorded for one fact.
pub fn refs_for_fact(conn: &Connection, fact_id: &str) -> Result<Vec<EntityRef>> {
    let mut stmt = conn.prepare(
        "SELECT fact_id, name, entity_type, canonical_id FROM entity_refs \
         WHERE fact_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![fact_id], |row| {
            Ok(EntityRef {
                fact_id: row.get(0)?,
                name: row.get(1)?,
                entity_type: row.get(2)?,
                canonical_id: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Distinct facts mentioning a canonical entity.
pub fn facts_for_entity(conn: &Connection, canonical_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT fact_id FROM entity_refs WHERE canonical_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![canonical_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// How many distinct facts mention a canonical entity (the IDF denominator).
pub fn fact_count_for_entity(conn: &Connection, canonical_id: &str) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(DISTINCT fact_id) FROM entity_refs WHERE canonical_id = ?1",
        params![canonical_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Timestamp of the most recent fact mentioning this entity, if any.
pub fn last_mention_at(conn: &Connection, canonical_id: &str) -> Result<Option<String>> {
    let ts: Option<String> = conn.query_row(
        "SELECT MAX(f.created_at) FROM entity_refs r \
         JOIN facts f ON f.id = r.fact_id \
         WHERE r.canonical_id = ?1",
        params![canonical_id],
        |row| row.get(0),
    )?;
    Ok(ts)
}

/// How many facts mentioning this entity share the given source document.
pub fn shared_source_count(
    conn: &Connection,
    canonical_id: &str,
    source_ref: &str,
) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(DISTINCT f.id) FROM entity_refs r \
         JOIN facts f ON f.id = r.fact_id \
         WHERE r.canonical_id = ?1 AND f.source_ref = ?2",
        params![canonical_id, source_ref],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::facts::{insert_fact, NewFact};
    use crate::memory::types::FactType;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    fn unit_embedding(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim % EMBEDDING_DIM] = 1.0;
        v
    }

    fn insert_test_fact(conn: &mut Connection, text: &str, source_ref: Option<&str>) -> String {
        insert_fact(
            conn,
            &NewFact {
                text: text.into(),
                fact_type: FactType::World,
                source_type: "manual".into(),
                source_ref: source_ref.map(String::from),
            },
            &unit_embedding(7),
        )
        .unwrap()
        .id
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let mut conn = test_db();
        let entity = insert_entity(&mut conn, "Acme Corp", "organization", &unit_embedding(0))
            .unwrap();

        let found = find_exact(&conn, "acme corp", "organization").unwrap().unwrap();
        assert_eq!(found.id, entity.id);

        // Different type does not match
        assert!(find_exact(&conn, "acme corp", "person").unwrap().is_none());
    }

    #[test]
    fn exact_match_prefers_earliest() {
        let mut conn = test_db();
        let first = insert_entity(&mut conn, "Dana", "person", &unit_embedding(0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _second = insert_entity(&mut conn, "dana", "person", &unit_embedding(1)).unwrap();

        let found = find_exact(&conn, "DANA", "person").unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[test]
    fn vector_candidates_order_by_distance() {
        let mut conn = test_db();
        let near = insert_entity(&mut conn, "Acme", "organization", &unit_embedding(0)).unwrap();
        let _far = insert_entity(&mut conn, "Globex", "organization", &unit_embedding(50))
            .unwrap();

        let results = candidates_by_vector(&conn, &unit_embedding(0), 10).unwrap();
        assert_eq!(results[0].0, near.id);
    }

    #[test]
    fn refs_join_signals() {
        let mut conn = test_db();
        let entity = insert_entity(&mut conn, "Acme", "organization", &unit_embedding(0)).unwrap();

        let f1 = insert_test_fact(&mut conn, "User works at Acme", Some("doc-1"));
        let f2 = insert_test_fact(&mut conn, "Acme shipped a new release", Some("doc-1"));
        let f3 = insert_test_fact(&mut conn, "Acme raised a round", Some("doc-2"));

        insert_ref(&conn, &f1, "Acme", "organization", Some(&entity.id)).unwrap();
        insert_ref(&conn, &f2, "Acme Corp", "organization", Some(&entity.id)).unwrap();
        insert_ref(&conn, &f3, "Acme", "organization", Some(&entity.id)).unwrap();

        assert_eq!(fact_count_for_entity(&conn, &entity.id).unwrap(), 3);
        assert_eq!(shared_source_count(&conn, &entity.id, "doc-1").unwrap(), 2);
        assert!(last_mention_at(&conn, &entity.id).unwrap().is_some());

        let mut facts = facts_for_entity(&conn, &entity.id).unwrap();
        facts.sort();
        let mut expected = vec![f1.clone(), f2.clone(), f3.clone()];
        expected.sort();
        assert_eq!(facts, expected);
    }

    #[test]
    fn ref_with_dangling_canonical_is_rejected() {
        let mut conn = test_db();
        let f1 = insert_test_fact(&mut conn, "Mentions a ghost", None);

        let result = insert_ref(&conn, &f1, "Ghost", "person", Some("no-such-entity"));
        assert!(result.is_err());
    }

    #[test]
    fn refs_cascade_on_fact_delete() {
        let mut conn = test_db();
        let entity = insert_entity(&mut conn, "Acme", "organization", &unit_embedding(0)).unwrap();
        let f1 = insert_test_fact(&mut conn, "User works at Acme", None);
        insert_ref(&conn, &f1, "Acme", "organization", Some(&entity.id)).unwrap();

        crate::memory::facts::delete_fact(&mut conn, &f1).unwrap();

        assert!(refs_for_fact(&conn, &f1).unwrap().is_empty());
        // Canonical entity itself survives
        assert!(get_entity(&conn, &entity.id).unwrap().is_some());
    }

    #[test]
    fn unresolved_ref_allowed() {
        let mut conn = test_db();
        let f1 = insert_test_fact(&mut conn, "Met someone new", None);
        insert_ref(&conn, &f1, "Unknown Visitor", "person", None).unwrap();

        let refs = refs_for_fact(&conn, &f1).unwrap();
        assert_eq!(refs.len(), 1);
        assert!(refs[0].canonical_id.is_none());
    }
}
