//! Fact linking: builds weighted edges from a new fact into the graph.
//!
//! Three derivations run per fact. Temporal links connect it to the most
//! recently created facts, weight decaying with the time gap. Semantic links
//! connect it to its nearest embedding neighbors above a similarity floor.
//! Entity links connect it to other facts sharing a canonical entity, with an
//! IDF-style weight so a rare entity binds its facts tighter than one that
//! appears everywhere. Candidate computation is read-only; [`persist_links`]
//! writes the batch in one transaction.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};

use crate::config::LinkingConfig;
use crate::memory::types::{Fact, FactLink, LinkType};
use crate::memory::{embedding_to_bytes, entities, l2_to_cosine};

/// Compute the outgoing links for a freshly inserted fact. Read-only; pass
/// the result to [`persist_links`]. Links below `config.min_weight` are
/// dropped here and never reach the database.
pub fn link_fact(
    conn: &Connection,
    fact: &Fact,
    embedding: &[f32],
    config: &LinkingConfig,
) -> Result<Vec<FactLink>> {
    let mut links = Vec::new();
    links.extend(temporal_links(conn, fact, config)?);
    links.extend(semantic_links(conn, fact, embedding, config)?);
    links.extend(entity_links(conn, fact, config)?);

    // A pair can carry one link per type; within a type keep the heaviest.
    let mut best: HashMap<(String, LinkType), FactLink> = HashMap::new();
    for link in links {
        let key = (link.target_fact_id.clone(), link.link_type);
        match best.get(&key) {
            Some(existing) if existing.weight >= link.weight => {}
            _ => {
                best.insert(key, link);
            }
        }
    }

    let mut result: Vec<FactLink> = best
        .into_values()
        .filter(|l| l.weight >= config.min_weight)
        .collect();
    // Deterministic order for persistence and tests
    result.sort_by(|a, b| {
        a.target_fact_id
            .cmp(&b.target_fact_id)
            .then(a.link_type.as_str().cmp(b.link_type.as_str()))
    });
    Ok(result)
}

/// Write a batch of links in a single transaction. Re-deriving an existing
/// edge is a no-op, so linking is idempotent.
pub fn persist_links(conn: &mut Connection, links: &[FactLink]) -> Result<()> {
    if links.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now().to_rfc3339();
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO fact_links \
             (source_fact_id, target_fact_id, link_type, weight, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for link in links {
            stmt.execute(params![
                link.source_fact_id,
                link.target_fact_id,
                link.link_type.as_str(),
                link.weight,
                now,
            ])?;
        }
    }
    tx.commit()?;
    tracing::debug!(count = links.len(), "persisted fact links");
    Ok(())
}

/// Edges incident to a fact, in both directions. Feeds graph expansion.
pub fn links_for_fact(conn: &Connection, fact_id: &str) -> Result<Vec<FactLink>> {
    use std::str::FromStr;
    let mut stmt = conn.prepare(
        "SELECT source_fact_id, target_fact_id, link_type, weight FROM fact_links \
         WHERE source_fact_id = ?1 OR target_fact_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![fact_id], |row| {
            let link_type: String = row.get(2)?;
            Ok(FactLink {
                source_fact_id: row.get(0)?,
                target_fact_id: row.get(1)?,
                link_type: LinkType::from_str(&link_type).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?,
                weight: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Drop every edge incident to a fact. Used before re-linking an edited fact.
pub fn delete_links_for_fact(conn: &Connection, fact_id: &str) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM fact_links WHERE source_fact_id = ?1 OR target_fact_id = ?1",
        params![fact_id],
    )?;
    Ok(deleted)
}

/// Links to the most recently created facts, weighted by a half-life decay
/// over the creation-time gap.
fn temporal_links(conn: &Connection, fact: &Fact, config: &LinkingConfig) -> Result<Vec<FactLink>> {
    let mut stmt = conn.prepare(
        "SELECT id, created_at FROM facts WHERE id != ?1 \
         ORDER BY created_at DESC LIMIT ?2",
    )?;
    let neighbors = stmt
        .query_map(params![fact.id, config.temporal_candidates as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let Ok(own_ts) = chrono::DateTime::parse_from_rfc3339(&fact.created_at) else {
        return Ok(Vec::new());
    };

    let mut links = Vec::new();
    for (target_id, created_at) in neighbors {
        let Ok(ts) = chrono::DateTime::parse_from_rfc3339(&created_at) else {
            continue;
        };
        let delta_hours = (own_ts - ts).num_seconds().abs() as f64 / 3600.0;
        let weight = 0.5f64.powf(delta_hours / config.temporal_half_life_hours);
        links.push(FactLink {
            source_fact_id: fact.id.clone(),
            target_fact_id: target_id,
            link_type: LinkType::Temporal,
            weight,
        });
    }
    Ok(links)
}

/// Links to nearest embedding neighbors with cosine similarity above the
/// configured floor. The similarity itself is the weight.
fn semantic_links(
    conn: &Connection,
    fact: &Fact,
    embedding: &[f32],
    config: &LinkingConfig,
) -> Result<Vec<FactLink>> {
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM facts_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    // +1 because the fact's own vector is already stored and ranks first
    let neighbors = stmt
        .query_map(
            params![
                embedding_to_bytes(embedding),
                (config.semantic_candidates + 1) as i64
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut links = Vec::new();
    for (target_id, distance) in neighbors {
        if target_id == fact.id {
            continue;
        }
        let similarity = l2_to_cosine(distance);
        if similarity > config.semantic_threshold {
            links.push(FactLink {
                source_fact_id: fact.id.clone(),
                target_fact_id: target_id,
                link_type: LinkType::Semantic,
                weight: similarity.min(1.0),
            });
        }
    }
    Ok(links)
}

/// Links to facts sharing a canonical entity. Weight is `1 / log2(n + 1)`
/// where `n` is how many facts mention the entity, capped at 1.0, so common
/// entities contribute weak edges and rare ones strong edges. At most
/// `config.entity_candidates` edges per entity, bounding the fan-out of an
/// entity that appears everywhere.
fn entity_links(conn: &Connection, fact: &Fact, config: &LinkingConfig) -> Result<Vec<FactLink>> {
    let refs = entities::refs_for_fact(conn, &fact.id)?;
    let canonical_ids: HashSet<String> = refs
        .into_iter()
        .filter_map(|r| r.canonical_id)
        .collect();

    let mut links = Vec::new();
    for canonical_id in canonical_ids {
        let n = entities::fact_count_for_entity(conn, &canonical_id)?;
        if n == 0 {
            continue;
        }
        let weight = (1.0 / (f64::from(n) + 1.0).log2()).min(1.0);
        for target_id in entities::facts_for_entity(conn, &canonical_id)?
            .into_iter()
            .filter(|target_id| *target_id != fact.id)
            .take(config.entity_candidates)
        {
            links.push(FactLink {
                source_fact_id: fact.id.clone(),
                target_fact_id: target_id,
                link_type: LinkType::Entity,
                weight,
            });
        }
    }
    Ok(links)
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

    fn test_config() -> LinkingConfig {
        LinkingConfig {
            min_weight: 0.1,
            temporal_half_life_hours: 24.0,
            temporal_candidates: 10,
            semantic_threshold: 0.75,
            semantic_candidates: 20,
            entity_candidates: 50,
        }
    }

    fn unit_embedding(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim % EMBEDDING_DIM] = 1.0;
        v
    }

    /// Unit vector leaning mostly toward `dim` with a small off-axis
    /// component, for controllable similarities.
    fn blended_embedding(dim: usize, other: usize, mix: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim % EMBEDDING_DIM] = (1.0 - mix * mix).sqrt();
        v[other % EMBEDDING_DIM] = mix;
        v
    }

    fn add_fact(conn: &mut Connection, text: &str, emb: &[f32]) -> Fact {
        insert_fact(
            conn,
            &NewFact {
                text: text.into(),
                fact_type: FactType::Experience,
                source_type: "manual".into(),
                source_ref: None,
            },
            emb,
        )
        .unwrap()
    }

    #[test]
    fn temporal_links_connect_recent_facts() {
        let mut conn = test_db();
        let config = test_config();
        let earlier = add_fact(&mut conn, "first thing happened", &unit_embedding(0));
        let fact = add_fact(&mut conn, "second thing happened", &unit_embedding(100));

        let links = link_fact(&conn, &fact, &unit_embedding(100), &config).unwrap();
        let temporal: Vec<&FactLink> = links
            .iter()
            .filter(|l| l.link_type == LinkType::Temporal)
            .collect();
        assert_eq!(temporal.len(), 1);
        assert_eq!(temporal[0].target_fact_id, earlier.id);
        // Near-simultaneous creation: weight close to 1
        assert!(temporal[0].weight > 0.99);
    }

    #[test]
    fn semantic_links_honor_threshold() {
        let mut conn = test_db();
        let config = test_config();

        // cos = 0.9 with dim 0, above the 0.75 floor
        let near = add_fact(
            &mut conn,
            "likes pour-over coffee",
            &blended_embedding(0, 1, (1.0f32 - 0.9 * 0.9).sqrt()),
        );
        // orthogonal, below the floor
        let far = add_fact(&mut conn, "owns a kayak", &unit_embedding(200));

        let fact = add_fact(&mut conn, "drinks espresso daily", &unit_embedding(0));
        let links = link_fact(&conn, &fact, &unit_embedding(0), &config).unwrap();
        let semantic: Vec<&FactLink> = links
            .iter()
            .filter(|l| l.link_type == LinkType::Semantic)
            .collect();

        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].target_fact_id, near.id);
        assert!((semantic[0].weight - 0.9).abs() < 0.01);
        assert!(!semantic.iter().any(|l| l.target_fact_id == far.id));
        assert!(!links.iter().any(|l| l.target_fact_id == fact.id), "no self links");
    }

    #[test]
    fn entity_links_weigh_rare_entities_heavier() {
        let mut conn = test_db();
        let config = test_config();

        let rare = entities::insert_entity(&mut conn, "Globex", "organization", &unit_embedding(1))
            .unwrap();
        let common =
            entities::insert_entity(&mut conn, "Acme", "organization", &unit_embedding(2)).unwrap();

        let rare_peer = add_fact(&mut conn, "Globex filed a patent", &unit_embedding(10));
        entities::insert_ref(&conn, &rare_peer.id, "Globex", "organization", Some(&rare.id))
            .unwrap();

        let mut common_peers = Vec::new();
        for i in 0..6 {
            let f = add_fact(&mut conn, &format!("Acme event number {i}"), &unit_embedding(20 + i));
            entities::insert_ref(&conn, &f.id, "Acme", "organization", Some(&common.id)).unwrap();
            common_peers.push(f.id);
        }

        let fact = add_fact(&mut conn, "Globex and Acme announced a deal", &unit_embedding(150));
        entities::insert_ref(&conn, &fact.id, "Globex", "organization", Some(&rare.id)).unwrap();
        entities::insert_ref(&conn, &fact.id, "Acme", "organization", Some(&common.id)).unwrap();

        let links = link_fact(&conn, &fact, &unit_embedding(150), &config).unwrap();
        let entity_links: HashMap<&str, f64> = links
            .iter()
            .filter(|l| l.link_type == LinkType::Entity)
            .map(|l| (l.target_fact_id.as_str(), l.weight))
            .collect();

        let rare_weight = entity_links[rare_peer.id.as_str()];
        let common_weight = entity_links[common_peers[0].as_str()];
        assert!(
            rare_weight > common_weight,
            "rare entity edge ({rare_weight}) should outweigh common ({common_weight})"
        );
        // n=2 facts mention Globex: 1/log2(3) ~ 0.63
        assert!((rare_weight - 1.0 / 3.0f64.log2()).abs() < 1e-9);
    }

    #[test]
    fn entity_candidates_bounds_edges_per_entity() {
        let mut conn = test_db();
        let mut config = test_config();
        config.entity_candidates = 2;

        let org =
            entities::insert_entity(&mut conn, "Initech", "organization", &unit_embedding(1))
                .unwrap();
        for i in 0..4 {
            let peer =
                add_fact(&mut conn, &format!("Initech memo {i}"), &unit_embedding(20 + i));
            entities::insert_ref(&conn, &peer.id, "Initech", "organization", Some(&org.id))
                .unwrap();
        }

        let fact = add_fact(&mut conn, "Initech restructured", &unit_embedding(150));
        entities::insert_ref(&conn, &fact.id, "Initech", "organization", Some(&org.id)).unwrap();

        let links = link_fact(&conn, &fact, &unit_embedding(150), &config).unwrap();
        let entity_edges = links
            .iter()
            .filter(|l| l.link_type == LinkType::Entity)
            .count();
        assert_eq!(entity_edges, 2);
    }

    #[test]
    fn min_weight_filters_and_weight_is_capped() {
        let mut conn = test_db();
        let mut config = test_config();
        config.min_weight = 0.95;

        let _earlier = add_fact(&mut conn, "background noise", &unit_embedding(0));
        let fact = add_fact(&mut conn, "the main fact", &unit_embedding(0));

        let links = link_fact(&conn, &fact, &unit_embedding(0), &config).unwrap();
        for link in &links {
            assert!(link.weight >= 0.95);
            assert!(link.weight <= 1.0);
        }
    }

    #[test]
    fn persist_is_idempotent_and_queryable_both_directions() {
        let mut conn = test_db();
        let a = add_fact(&mut conn, "fact a", &unit_embedding(0));
        let b = add_fact(&mut conn, "fact b", &unit_embedding(1));

        let links = vec![FactLink {
            source_fact_id: a.id.clone(),
            target_fact_id: b.id.clone(),
            link_type: LinkType::Temporal,
            weight: 0.8,
        }];
        persist_links(&mut conn, &links).unwrap();
        persist_links(&mut conn, &links).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM fact_links", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        // Visible from both endpoints
        assert_eq!(links_for_fact(&conn, &a.id).unwrap().len(), 1);
        assert_eq!(links_for_fact(&conn, &b.id).unwrap().len(), 1);

        assert_eq!(delete_links_for_fact(&conn, &b.id).unwrap(), 1);
        assert!(links_for_fact(&conn, &a.id).unwrap().is_empty());
    }

    #[test]
    fn links_cascade_on_fact_delete() {
        let mut conn = test_db();
        let a = add_fact(&mut conn, "linked fact", &unit_embedding(0));
        let b = add_fact(&mut conn, "other fact", &unit_embedding(1));
        persist_links(
            &mut conn,
            &[FactLink {
                source_fact_id: a.id.clone(),
                target_fact_id: b.id.clone(),
                link_type: LinkType::Semantic,
                weight: 0.9,
            }],
        )
        .unwrap();

        crate::memory::facts::delete_fact(&mut conn, &b.id).unwrap();
        assert!(links_for_fact(&conn, &a.id).unwrap().is_empty());
    }
}
