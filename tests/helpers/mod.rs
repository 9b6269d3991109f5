//! Shared test doubles: a deterministic embedder and a scripted language
//! model, plus engine setup against a temp-file database (the engine needs
//! two connections to the same database, which `:memory:` cannot provide).

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use mnemon::config::MnemonConfig;
use mnemon::db;
use mnemon::embedding::{EmbeddingProvider, EMBEDDING_DIM};
use mnemon::memory::FactMemory;
use mnemon::model::{ConsolidationDecision, EntityMention, LanguageModel, ObservationSummary};

/// Deterministic embedder: each lowercase token lights up one dimension, so
/// texts sharing words are similar and disjoint texts are orthogonal.
pub struct TokenEmbedder;

impl EmbeddingProvider for TokenEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for token in text.to_lowercase().split_whitespace() {
            let mut h: usize = 5381;
            for b in token.bytes() {
                h = h.wrapping_mul(33) ^ b as usize;
            }
            v[h % EMBEDDING_DIM] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

/// What the scripted model does when asked to consolidate.
pub enum ConsolidatePolicy {
    /// Always decline.
    Skip,
    /// Always start a new observation with this summary.
    CreateWith(String),
    /// Fold into the closest offered observation, or create if none offered.
    FoldOrCreate(String),
}

/// A model with a fixed pool of known entities and a fixed consolidation
/// policy. Extraction returns the known entities whose names appear in the
/// text, so different facts get different mentions.
pub struct ScriptedModel {
    pub known_entities: Vec<EntityMention>,
    pub policy: ConsolidatePolicy,
    /// Artificial latency per model call, for lock-scope tests.
    pub delay: Duration,
}

impl ScriptedModel {
    pub fn inert() -> Self {
        Self {
            known_entities: Vec::new(),
            policy: ConsolidatePolicy::Skip,
            delay: Duration::ZERO,
        }
    }

    pub fn with_entities(mut self, entities: &[(&str, &str)]) -> Self {
        self.known_entities = entities
            .iter()
            .map(|(name, entity_type)| EntityMention {
                name: name.to_string(),
                entity_type: entity_type.to_string(),
            })
            .collect();
        self
    }

    pub fn with_policy(mut self, policy: ConsolidatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn extract_entities(&self, text: &str) -> Result<Vec<EntityMention>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .known_entities
            .iter()
            .filter(|m| text.contains(&m.name))
            .cloned()
            .collect())
    }

    async fn consolidate(
        &self,
        _fact_text: &str,
        similar: &[ObservationSummary],
    ) -> Result<ConsolidationDecision> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(match &self.policy {
            ConsolidatePolicy::Skip => ConsolidationDecision::Skip,
            ConsolidatePolicy::CreateWith(summary) => ConsolidationDecision::Create {
                summary: summary.clone(),
            },
            ConsolidatePolicy::FoldOrCreate(summary) => match similar.first() {
                Some(obs) => ConsolidationDecision::Update {
                    observation_id: obs.id.clone(),
                    summary: summary.clone(),
                },
                None => ConsolidationDecision::Create {
                    summary: summary.clone(),
                },
            },
        })
    }
}

pub fn db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("memory.db")
}

/// Engine over a temp database with the given scripted model.
pub fn open_memory(model: ScriptedModel) -> (tempfile::TempDir, FactMemory) {
    open_memory_with_config(model, MnemonConfig::default())
}

pub fn open_memory_with_config(
    model: ScriptedModel,
    config: MnemonConfig,
) -> (tempfile::TempDir, FactMemory) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = db_path(&dir);
    let writer = db::open_database(&path).expect("writer connection");
    let reader = db::open_database(&path).expect("reader connection");
    let memory = FactMemory::new(writer, reader, Arc::new(TokenEmbedder), Arc::new(model), config);
    (dir, memory)
}
