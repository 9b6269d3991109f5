//! Hybrid recall pipeline.
//!
//! A query runs four stages over facts: vector KNN and BM25 keyword search
//! produce two ranked lists; reciprocal-rank fusion merges them into a seed
//! set; bounded breadth-first expansion walks fact links outward from the
//! seeds, discounting each hop by its edge weight; finally a decay adjustment
//! rewards recently and frequently accessed facts. Observations are matched
//! separately by vector similarity. Everything here is read-only; the caller
//! reinforces returned ids afterwards, outside the search path.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;

use crate::config::RetrievalConfig;
use crate::memory::types::{FactContext, ScoredFact, ScoredObservation};
use crate::memory::{
    cosine_threshold_to_l2, embedding_to_bytes, facts, l2_to_cosine, linker, observations,
};

/// A recall request: the raw query text plus its embedding, computed by the
/// caller outside any lock.
pub struct RecallQuery<'a> {
    pub text: &'a str,
    pub embedding: &'a [f32],
    /// Maximum facts returned.
    pub limit: usize,
}

/// Run the full recall pipeline. Read-only.
pub fn recall(
    conn: &Connection,
    query: &RecallQuery<'_>,
    config: &RetrievalConfig,
) -> Result<FactContext> {
    let limit = query.limit.max(1);
    // Each candidate list over-fetches so fusion has something to disagree on
    let pool = limit * 3;

    let vector_ranked = vector_candidates(conn, query.embedding, pool, config.min_similarity)?;
    let keyword_ranked = keyword_candidates(conn, query.text, pool)?;

    if vector_ranked.is_empty() && keyword_ranked.is_empty() {
        return Ok(FactContext {
            facts: Vec::new(),
            observations: recall_observations(conn, query.embedding, config)?,
        });
    }

    let mut seeds = rrf_fuse(&[&vector_ranked, &keyword_ranked], config.rrf_k);
    seeds.truncate(limit);

    let expanded = expand_graph(conn, &seeds, config)?;

    // Seeds keep their fused score; discovered facts carry their discounted
    // score. A fact found both ways keeps the larger.
    let mut scores: HashMap<String, f64> = seeds.into_iter().collect();
    for (id, score) in expanded {
        let entry = scores.entry(id).or_insert(0.0);
        if score > *entry {
            *entry = score;
        }
    }

    let ids: Vec<&str> = scores.keys().map(String::as_str).collect();
    let records = facts::fetch_facts(conn, &ids)?;

    let now = chrono::Utc::now();
    let mut ranked: Vec<ScoredFact> = Vec::with_capacity(records.len());
    for (id, base_score) in &scores {
        // Ids can vanish between candidate search and fetch; skip them
        let Some(fact) = records.get(id) else { continue };
        let last_touch = fact.last_accessed.as_deref().unwrap_or(&fact.created_at);
        let adjusted = base_score
            * decay_factor(now, last_touch, fact.access_count, config.decay_rate);
        ranked.push(ScoredFact {
            fact: fact.clone(),
            score: adjusted,
        });
    }
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.fact.id.cmp(&b.fact.id))
    });
    ranked.truncate(limit);

    Ok(FactContext {
        facts: ranked,
        observations: recall_observations(conn, query.embedding, config)?,
    })
}

/// Nearest facts by embedding, best first. KNN alone would return the
/// nearest rows no matter how far they are, so a similarity floor keeps
/// unrelated facts out of the seed set in a small corpus.
fn vector_candidates(
    conn: &Connection,
    embedding: &[f32],
    limit: usize,
    min_similarity: f64,
) -> Result<Vec<String>> {
    // sqlite-vec ranks by L2 distance, so the floor crosses into distance
    // space once instead of converting every row back to a similarity
    let max_distance = cosine_threshold_to_l2(min_similarity);
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM facts_vec WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|(_, distance)| *distance <= max_distance)
        .map(|(id, _)| id)
        .collect())
}

/// BM25 keyword matches, best first. An unmatchable query yields an empty
/// list rather than an error.
fn keyword_candidates(conn: &Connection, text: &str, limit: usize) -> Result<Vec<String>> {
    let Some(fts_query) = escape_fts_query(text) else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(
        "SELECT id FROM facts_fts WHERE facts_fts MATCH ?1 ORDER BY rank LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![fts_query, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Quote each token so FTS5 operators in user text are inert. Returns None
/// when no searchable token remains.
fn escape_fts_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// Reciprocal-rank fusion across ranked id lists: `score = sum 1/(k + rank)`.
/// Output is sorted best first, ties broken by id for determinism.
fn rrf_fuse(lists: &[&Vec<String>], k: usize) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k + rank + 1) as f64;
        }
    }
    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused
}

/// Bounded BFS over fact links, both directions. A discovered fact scores
/// its seed's score times the product of edge weights along the path; since
/// weights are in (0, 1], scores only shrink with distance. Total discovery
/// is capped by the frontier limit, and already-seen facts are never
/// re-scored higher through a longer path in the same pass.
fn expand_graph(
    conn: &Connection,
    seeds: &[(String, f64)],
    config: &RetrievalConfig,
) -> Result<Vec<(String, f64)>> {
    let mut best: HashMap<String, f64> =
        seeds.iter().map(|(id, s)| (id.clone(), *s)).collect();
    let mut frontier: Vec<(String, f64)> = seeds.to_vec();
    let mut discovered: Vec<(String, f64)> = Vec::new();

    for _hop in 0..config.graph_max_hops {
        if frontier.is_empty() || discovered.len() >= config.graph_frontier_limit {
            break;
        }
        let mut next_frontier = Vec::new();
        for (id, score) in &frontier {
            for link in linker::links_for_fact(conn, id)? {
                if discovered.len() >= config.graph_frontier_limit {
                    break;
                }
                let neighbor = if link.source_fact_id == *id {
                    link.target_fact_id
                } else {
                    link.source_fact_id
                };
                let neighbor_score = score * link.weight;
                match best.get(&neighbor) {
                    Some(existing) if *existing >= neighbor_score => continue,
                    _ => {}
                }
                best.insert(neighbor.clone(), neighbor_score);
                discovered.push((neighbor.clone(), neighbor_score));
                next_frontier.push((neighbor, neighbor_score));
            }
        }
        frontier = next_frontier;
    }
    Ok(discovered)
}

/// Recency/usage adjustment: `decay_rate ^ (hours_since_access / strength)`
/// with `strength = ln(access_count + 1) + 1`. Frequently accessed facts have
/// higher strength and therefore decay slower.
fn decay_factor(
    now: chrono::DateTime<chrono::Utc>,
    last_touch: &str,
    access_count: u32,
    decay_rate: f64,
) -> f64 {
    let Ok(ts) = chrono::DateTime::parse_from_rfc3339(last_touch) else {
        return 1.0;
    };
    let hours = (now - ts.with_timezone(&chrono::Utc))
        .num_seconds()
        .max(0) as f64
        / 3600.0;
    let strength = (f64::from(access_count) + 1.0).ln() + 1.0;
    decay_rate.powf(hours / strength)
}

/// Observations matching the query embedding, scored by cosine similarity.
fn recall_observations(
    conn: &Connection,
    embedding: &[f32],
    config: &RetrievalConfig,
) -> Result<Vec<ScoredObservation>> {
    let hits = observations::vector_search(conn, embedding, config.observation_limit)?;
    let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
    let mut records = observations::fetch_observations(conn, &ids)?;
    let mut scored = Vec::with_capacity(hits.len());
    for (id, distance) in &hits {
        if let Some(observation) = records.remove(id) {
            scored.push(ScoredObservation {
                observation,
                score: l2_to_cosine(*distance),
            });
        }
    }
    Ok(scored)
}
