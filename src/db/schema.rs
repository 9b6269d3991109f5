//! SQL DDL for all mnemon tables.
//!
//! Defines the fact store (`facts`, `facts_fts`, `facts_vec`), the observation
//! store (`observations`, `observations_fts`, `observations_vec`,
//! `observation_facts`), and the entity graph (`entities`, `entities_vec`,
//! `entity_refs`, `fact_links`). All DDL uses `IF NOT EXISTS` for idempotent
//! initialization; schema changes are additive-only (no migration mechanism).

use rusqlite::Connection;

/// All schema DDL statements for mnemon's core tables.
const SCHEMA_SQL: &str = r#"
-- Atomic facts: verbatim stored observations
CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    fact_type TEXT NOT NULL CHECK(fact_type IN ('world','experience')),
    source_type TEXT NOT NULL,
    source_ref TEXT,
    consolidation TEXT NOT NULL DEFAULT 'pending'
        CHECK(consolidation IN ('pending','done','skipped')),
    consolidated_at TEXT,
    last_attempt_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_facts_type ON facts(fact_type);
CREATE INDEX IF NOT EXISTS idx_facts_consolidation ON facts(consolidation);
CREATE INDEX IF NOT EXISTS idx_facts_source_ref ON facts(source_ref);
CREATE INDEX IF NOT EXISTS idx_facts_created ON facts(created_at);

-- Full-text search over fact text (BM25)
CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
    text,
    id UNINDEXED,
    content='facts',
    content_rowid='rowid'
);

-- Synthesized observations distilled from facts by the consolidator
CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    summary TEXT NOT NULL,
    evidence_count INTEGER NOT NULL DEFAULT 0,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    summary,
    id UNINDEXED,
    content='observations',
    content_rowid='rowid'
);

-- Which facts contributed to which observation. fact_id is deliberately not
-- FK-cascaded: evidence rows may outlive deleted facts, and evidence_count is
-- allowed to drift after fact deletion.
CREATE TABLE IF NOT EXISTS observation_facts (
    observation_id TEXT NOT NULL REFERENCES observations(id) ON DELETE CASCADE,
    fact_id TEXT NOT NULL,
    PRIMARY KEY (observation_id, fact_id)
);

CREATE INDEX IF NOT EXISTS idx_observation_facts_fact ON observation_facts(fact_id);

-- Canonical entities produced by resolution
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name COLLATE NOCASE, entity_type);

-- A mention of an entity inside one fact. canonical_id is NULL while unresolved.
CREATE TABLE IF NOT EXISTS entity_refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fact_id TEXT NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    canonical_id TEXT REFERENCES entities(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_entity_refs_fact ON entity_refs(fact_id);
CREATE INDEX IF NOT EXISTS idx_entity_refs_canonical ON entity_refs(canonical_id);

-- Weighted fact graph. One row per (pair, type); multiple link types may
-- coexist between the same pair.
CREATE TABLE IF NOT EXISTS fact_links (
    source_fact_id TEXT NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
    target_fact_id TEXT NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
    link_type TEXT NOT NULL CHECK(link_type IN ('temporal','semantic','entity')),
    weight REAL NOT NULL CHECK(weight > 0.0 AND weight <= 1.0),
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_fact_id, target_fact_id, link_type)
);

CREATE INDEX IF NOT EXISTS idx_fact_links_target ON fact_links(target_fact_id);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual tables must be created separately (sqlite-vec syntax).
const VEC_TABLES_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS facts_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);

CREATE VIRTUAL TABLE IF NOT EXISTS observations_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);

CREATE VIRTUAL TABLE IF NOT EXISTS entities_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLES_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
