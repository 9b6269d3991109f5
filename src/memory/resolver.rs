//! Multi-signal entity resolution.
//!
//! Decides whether a newly extracted entity mention refers to an existing
//! canonical entity or warrants a new one. Exact case-insensitive name+type
//! matches short-circuit; otherwise candidates gathered by type and by
//! name-embedding KNN are scored on three signals (string similarity,
//! source co-occurrence, temporal proximity) and merged when the best score
//! clears the auto-merge threshold. The merge policy is approximate: false
//! merges and false splits are both possible and acceptable at the default
//! threshold.

use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashMap;

use crate::config::ResolutionConfig;
use crate::memory::entities;
use crate::memory::types::Entity;

/// Signal weights for the combined candidate score.
const STRING_WEIGHT: f64 = 0.5;
const COOCCURRENCE_WEIGHT: f64 = 0.3;
const TEMPORAL_WEIGHT: f64 = 0.2;

/// Outcome of resolving one mention.
#[derive(Debug)]
pub struct Resolution {
    pub entity_id: String,
    /// `true` if no candidate cleared the threshold and a new entity was made.
    pub created: bool,
}

/// Context the scorer needs about the mention being resolved.
pub struct MentionContext<'a> {
    /// Source document of the fact containing the mention, if any.
    pub source_ref: Option<&'a str>,
    /// Embedding of the mention name, computed by the caller (no network
    /// calls happen inside resolve).
    pub name_embedding: &'a [f32],
}

#[derive(Debug)]
struct ScoredCandidate {
    entity: Entity,
    string_sim: f64,
    score: f64,
}

/// Resolve a mention to a canonical entity, creating one if needed.
///
/// Database-only; the caller owns lock scoping and must precompute the name
/// embedding outside any lock.
pub fn resolve(
    conn: &mut Connection,
    name: &str,
    entity_type: &str,
    ctx: &MentionContext<'_>,
    config: &ResolutionConfig,
) -> Result<Resolution> {
    // 1. Exact case-insensitive match short-circuits.
    if let Some(entity) = entities::find_exact(conn, name, entity_type)? {
        return Ok(Resolution {
            entity_id: entity.id,
            created: false,
        });
    }

    // 2. Gather candidates by type and by name-vector KNN; dedupe.
    let mut candidates: HashMap<String, Entity> = HashMap::new();
    for entity in entities::candidates_by_type(conn, entity_type, config.candidate_limit)? {
        candidates.insert(entity.id.clone(), entity);
    }
    for (id, _distance) in
        entities::candidates_by_vector(conn, ctx.name_embedding, config.candidate_limit)?
    {
        if !candidates.contains_key(&id) {
            if let Some(entity) = entities::get_entity(conn, &id)? {
                // Cross-type merges are never allowed
                if entity.entity_type == entity_type {
                    candidates.insert(id, entity);
                }
            }
        }
    }

    // 3. Score and rank. Ties break by string similarity, then earliest
    // creation, keeping resolution deterministic.
    let mut scored: Vec<ScoredCandidate> = Vec::with_capacity(candidates.len());
    for entity in candidates.into_values() {
        scored.push(score_candidate(conn, name, &entity, ctx, config)?);
    }
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.string_sim
                    .partial_cmp(&a.string_sim)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.entity.created_at.cmp(&b.entity.created_at))
    });

    if let Some(best) = scored.first() {
        if best.score >= config.auto_merge_threshold {
            tracing::debug!(
                mention = name,
                entity = %best.entity.name,
                score = best.score,
                "merged mention into existing entity"
            );
            return Ok(Resolution {
                entity_id: best.entity.id.clone(),
                created: false,
            });
        }
    }

    // 4. No candidate cleared the threshold: mint a new canonical entity.
    let entity = entities::insert_entity(conn, name, entity_type, ctx.name_embedding)?;
    Ok(Resolution {
        entity_id: entity.id,
        created: true,
    })
}

/// Weighted combination of string similarity, source co-occurrence, and
/// temporal proximity for one candidate.
fn score_candidate(
    conn: &Connection,
    name: &str,
    entity: &Entity,
    ctx: &MentionContext<'_>,
    config: &ResolutionConfig,
) -> Result<ScoredCandidate> {
    let string_sim = name_similarity(name, &entity.name);
    let cooccurrence = match ctx.source_ref {
        Some(source_ref) => {
            let shared = entities::shared_source_count(conn, &entity.id, source_ref)?;
            (f64::from(shared) / 2.0).min(1.0)
        }
        None => 0.0,
    };
    let temporal = match entities::last_mention_at(conn, &entity.id)? {
        Some(ts) => temporal_proximity(&ts, config.temporal_half_life_hours),
        None => 0.0,
    };

    let score = STRING_WEIGHT * string_sim
        + COOCCURRENCE_WEIGHT * cooccurrence
        + TEMPORAL_WEIGHT * temporal;

    Ok(ScoredCandidate {
        entity: entity.clone(),
        string_sim,
        score,
    })
}

/// Jaro-Winkler similarity on lowercased names: sequence matching with a
/// shared-prefix bonus.
fn name_similarity(a: &str, b: &str) -> f64 {
    strsim::jaro_winkler(&a.to_lowercase(), &b.to_lowercase())
}

/// Exponential decay over the time since the entity was last mentioned.
fn temporal_proximity(last_mention: &str, half_life_hours: f64) -> f64 {
    let Ok(ts) = chrono::DateTime::parse_from_rfc3339(last_mention) else {
        return 0.0;
    };
    let delta_hours = (chrono::Utc::now() - ts.with_timezone(&chrono::Utc))
        .num_seconds()
        .max(0) as f64
        / 3600.0;
    0.5f64.powf(delta_hours / half_life_hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::embedding::EMBEDDING_DIM;
    use crate::memory::facts::{insert_fact, NewFact};
    use crate::memory::types::FactType;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    fn test_config() -> ResolutionConfig {
        ResolutionConfig {
            auto_merge_threshold: 0.85,
            candidate_limit: 50,
            temporal_half_life_hours: 168.0,
        }
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
            &unit_embedding(3),
        )
        .unwrap()
        .id
    }

    #[test]
    fn exact_match_short_circuits() {
        let mut conn = test_db();
        let emb = unit_embedding(0);

        let first = resolve(
            &mut conn,
            "Acme Corp",
            "organization",
            &MentionContext {
                source_ref: None,
                name_embedding: &emb,
            },
            &test_config(),
        )
        .unwrap();
        assert!(first.created);

        // Same name, different case: no new entity
        let second = resolve(
            &mut conn,
            "ACME CORP",
            "organization",
            &MentionContext {
                source_ref: None,
                name_embedding: &emb,
            },
            &test_config(),
        )
        .unwrap();
        assert!(!second.created);
        assert_eq!(second.entity_id, first.entity_id);
    }

    #[test]
    fn merge_is_stable_across_repeated_resolution() {
        let mut conn = test_db();
        let emb = unit_embedding(0);
        let ctx = MentionContext {
            source_ref: None,
            name_embedding: &emb,
        };

        let a = resolve(&mut conn, "Dana", "person", &ctx, &test_config()).unwrap();
        let b = resolve(&mut conn, "Dana", "person", &ctx, &test_config()).unwrap();
        assert_eq!(a.entity_id, b.entity_id);
        assert!(!b.created);
    }

    #[test]
    fn similar_name_with_cooccurrence_merges() {
        let mut conn = test_db();
        let emb = unit_embedding(0);

        // Canonical entity mentioned twice in doc-1, recently
        let entity =
            entities::insert_entity(&mut conn, "Acme Corp", "organization", &emb).unwrap();
        for text in ["User works at Acme Corp", "Acme Corp shipped v2"] {
            let fact_id = insert_test_fact(&mut conn, text, Some("doc-1"));
            entities::insert_ref(&conn, &fact_id, "Acme Corp", "organization", Some(&entity.id))
                .unwrap();
        }

        // Near-identical name from the same document: string similarity plus
        // co-occurrence plus recency clears the threshold.
        let result = resolve(
            &mut conn,
            "Acme Corporation",
            "organization",
            &MentionContext {
                source_ref: Some("doc-1"),
                name_embedding: &emb,
            },
            &test_config(),
        )
        .unwrap();
        assert!(!result.created, "should merge into the existing entity");
        assert_eq!(result.entity_id, entity.id);
    }

    #[test]
    fn unrelated_name_creates_new_entity() {
        let mut conn = test_db();
        let acme_emb = unit_embedding(0);
        let entity =
            entities::insert_entity(&mut conn, "Acme Corp", "organization", &acme_emb).unwrap();

        let globex_emb = unit_embedding(50);
        let result = resolve(
            &mut conn,
            "Globex",
            "organization",
            &MentionContext {
                source_ref: None,
                name_embedding: &globex_emb,
            },
            &test_config(),
        )
        .unwrap();
        assert!(result.created);
        assert_ne!(result.entity_id, entity.id);
    }

    #[test]
    fn same_name_different_type_stays_split() {
        let mut conn = test_db();
        let emb = unit_embedding(0);
        let org = resolve(
            &mut conn,
            "Mercury",
            "organization",
            &MentionContext {
                source_ref: None,
                name_embedding: &emb,
            },
            &test_config(),
        )
        .unwrap();

        let person = resolve(
            &mut conn,
            "Mercury",
            "person",
            &MentionContext {
                source_ref: None,
                name_embedding: &emb,
            },
            &test_config(),
        )
        .unwrap();
        assert!(person.created);
        assert_ne!(person.entity_id, org.entity_id);
    }

    #[test]
    fn name_similarity_prefix_bonus() {
        let close = name_similarity("Acme Corp", "Acme Corporation");
        let far = name_similarity("Acme Corp", "Globex");
        assert!(close > 0.85, "prefix-sharing names score high, got {close}");
        assert!(far < 0.6, "unrelated names score low, got {far}");
        // Case-insensitive
        assert!((name_similarity("DANA", "dana") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn temporal_proximity_decays() {
        let now = chrono::Utc::now().to_rfc3339();
        let old = (chrono::Utc::now() - chrono::Duration::hours(336)).to_rfc3339();

        let recent_score = temporal_proximity(&now, 168.0);
        let old_score = temporal_proximity(&old, 168.0);
        assert!(recent_score > 0.99);
        assert!((old_score - 0.25).abs() < 0.01, "two half-lives -> 0.25");
        assert_eq!(temporal_proximity("not-a-date", 168.0), 0.0);
    }
}
