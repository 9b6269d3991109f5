//! Consolidation: folding pending facts into observations.
//!
//! Each tick examines a batch of eligible facts. For every fact the engine
//! gathers the most similar observations under the read path, asks the model
//! to decide (create, update, or skip) with no lock held, then commits that
//! one fact's outcome under the write lock. A slow or failing model therefore
//! never stalls writers, and each fact settles independently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use crate::memory::types::Fact;
use crate::memory::{facts, observations, FactMemory};
use crate::model::{ConsolidationDecision, ObservationSummary};

/// Counters for one consolidation tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub examined: usize,
    pub consolidated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What the write phase did with a fact.
#[derive(Debug, PartialEq)]
pub enum Applied {
    Created { observation_id: String },
    Updated { observation_id: String },
    Skipped,
}

/// Read phase: the observations most similar to a fact, as candidates the
/// model may fold the fact into.
pub fn similar_observations(
    conn: &Connection,
    fact_embedding: &[f32],
    limit: usize,
) -> Result<Vec<ObservationSummary>> {
    let hits = observations::vector_search(conn, fact_embedding, limit)?;
    let mut summaries = Vec::with_capacity(hits.len());
    for (id, _distance) in hits {
        if let Some(obs) = observations::get_observation(conn, &id)? {
            summaries.push(ObservationSummary {
                id: obs.id,
                summary: obs.summary,
            });
        }
    }
    Ok(summaries)
}

/// Write phase: commit the model's decision for one fact.
///
/// The observation write and the fact's state change go into one transaction,
/// so a crash can never leave an observation behind with its source fact
/// still pending (which the next tick would fold again).
///
/// An update naming an observation that was not offered (or no longer exists)
/// is treated as a skip; the model only gets to pick from what it saw.
pub fn apply_decision(
    conn: &mut Connection,
    fact: &Fact,
    decision: &ConsolidationDecision,
    summary_embedding: Option<&[f32]>,
    offered: &[ObservationSummary],
) -> Result<Applied> {
    let tx = conn.transaction()?;
    let applied = match decision {
        ConsolidationDecision::Create { summary } => {
            let embedding = summary_embedding
                .ok_or_else(|| anyhow::anyhow!("create decision without summary embedding"))?;
            let obs = observations::insert_observation_tx(&tx, summary, embedding, &[&fact.id])?;
            facts::mark_consolidated(&tx, &fact.id)?;
            tracing::debug!(fact = %fact.id, observation = %obs.id, "observation created");
            Applied::Created {
                observation_id: obs.id,
            }
        }
        ConsolidationDecision::Update {
            observation_id,
            summary,
        } => {
            if !offered.iter().any(|o| o.id == *observation_id) {
                tracing::warn!(
                    fact = %fact.id,
                    observation = %observation_id,
                    "model chose an observation it was not offered, skipping"
                );
                facts::mark_skipped(&tx, &fact.id)?;
                Applied::Skipped
            } else {
                let embedding = summary_embedding
                    .ok_or_else(|| anyhow::anyhow!("update decision without summary embedding"))?;
                if observations::update_observation_tx(
                    &tx,
                    observation_id,
                    summary,
                    embedding,
                    &fact.id,
                )? {
                    facts::mark_consolidated(&tx, &fact.id)?;
                    tracing::debug!(fact = %fact.id, observation = %observation_id, "observation updated");
                    Applied::Updated {
                        observation_id: observation_id.clone(),
                    }
                } else {
                    // Deleted between read and write phase
                    facts::mark_skipped(&tx, &fact.id)?;
                    Applied::Skipped
                }
            }
        }
        ConsolidationDecision::Skip => {
            facts::mark_skipped(&tx, &fact.id)?;
            Applied::Skipped
        }
    };
    tx.commit()?;
    Ok(applied)
}

/// Drive consolidation ticks on an interval until cancelled. Cancellation
/// also interrupts a tick already in flight, so shutdown never waits for a
/// full batch of model calls. Intended to run as a background task next to a
/// server loop.
pub async fn run_loop(memory: Arc<FactMemory>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it so the loop waits a full
    // interval before its first pass.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("consolidation loop stopped");
                break;
            }
            _ = ticker.tick() => {
                match memory.consolidation_tick_cancellable(&cancel).await {
                    Ok(report) if report.examined > 0 => tracing::info!(
                        examined = report.examined,
                        consolidated = report.consolidated,
                        skipped = report.skipped,
                        failed = report.failed,
                        "consolidation tick"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "consolidation tick failed"),
                }
            }
        }
    }
}
