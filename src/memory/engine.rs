//! The `FactMemory` facade: single entry point tying storage, embedding,
//! the language model, and the pipeline stages together.
//!
//! Concurrency model: one writer connection behind a mutex serializes all
//! mutations; a second reader connection serves recall and the consolidation
//! read phase (WAL keeps readers unblocked by the writer). Neither lock is
//! ever held across an embedding task or a model call, so a slow model can
//! never stall writes.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::MnemonConfig;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::memory::consolidate::{self, Applied, TickReport};
use crate::memory::facts::{self, NewFact};
use crate::memory::resolver::{self, MentionContext};
use crate::memory::retrieval::{self, RecallQuery};
use crate::memory::types::{Fact, FactContext, FactType, MemoryEvent};
use crate::memory::{entities, linker, observations};
use crate::model::{ConsolidationDecision, LanguageModel};

/// Row counts across the core tables.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MemoryStats {
    pub facts: u64,
    pub observations: u64,
    pub entities: u64,
    pub links: u64,
}

pub struct FactMemory {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn LanguageModel>,
    config: MnemonConfig,
    events: broadcast::Sender<MemoryEvent>,
}

impl FactMemory {
    /// Assemble a memory from its parts. Both connections must point at the
    /// same database.
    pub fn new(
        writer: Connection,
        reader: Connection,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
        config: MnemonConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            embedder,
            model,
            config,
            events,
        }
    }

    /// Open the configured database and build the default providers.
    pub fn open(config: MnemonConfig) -> Result<Self> {
        let path = config.resolved_db_path();
        let writer = db::open_database(&path)?;
        let reader = db::open_database(&path)?;
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::create_provider(&config.embedding)?);
        let model: Arc<dyn LanguageModel> =
            Arc::new(crate::model::openai::OpenAiModel::new(&config.model)?);
        Ok(Self::new(writer, reader, embedder, model, config))
    }

    pub fn config(&self) -> &MnemonConfig {
        &self.config
    }

    /// Subscribe to mutation events. Delivery is best-effort: a lagging
    /// subscriber loses events rather than blocking the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    /// Store a new fact: embed, persist, resolve its entities, and link it
    /// into the graph. Entity extraction is best-effort; a model failure
    /// stores the fact without entity refs, and a mention that cannot be
    /// embedded is skipped.
    pub async fn remember(
        &self,
        text: &str,
        fact_type: FactType,
        source_type: &str,
        source_ref: Option<&str>,
    ) -> Result<Fact> {
        let embedding = self.embed(text).await?;
        let new = NewFact {
            text: text.to_string(),
            fact_type,
            source_type: source_type.to_string(),
            source_ref: source_ref.map(String::from),
        };
        let fact = {
            let mut conn = self.writer()?;
            facts::insert_fact(&mut conn, &new, &embedding)?
        };

        let mentions = match self.model.extract_entities(text).await {
            Ok(mentions) => mentions,
            Err(e) => {
                tracing::warn!(fact = %fact.id, error = %e, "entity extraction failed, storing fact without entity refs");
                Vec::new()
            }
        };
        for mention in mentions {
            // The fact row is already committed; a mention that cannot be
            // embedded is dropped rather than failing the whole remember.
            let name_embedding = match self.embed(&mention.name).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(fact = %fact.id, mention = %mention.name, error = %e, "mention embedding failed, skipping entity ref");
                    continue;
                }
            };
            let mut conn = self.writer()?;
            let resolution = resolver::resolve(
                &mut conn,
                &mention.name,
                &mention.entity_type,
                &MentionContext {
                    source_ref,
                    name_embedding: &name_embedding,
                },
                &self.config.resolution,
            )?;
            entities::insert_ref(
                &conn,
                &fact.id,
                &mention.name,
                &mention.entity_type,
                Some(&resolution.entity_id),
            )?;
        }

        let links = {
            let conn = self.reader()?;
            linker::link_fact(&conn, &fact, &embedding, &self.config.linking)?
        };
        {
            let mut conn = self.writer()?;
            linker::persist_links(&mut conn, &links)?;
        }

        tracing::info!(fact = %fact.id, links = links.len(), "fact remembered");
        self.emit(MemoryEvent::FactCreated {
            fact_id: fact.id.clone(),
        });
        Ok(fact)
    }

    /// Retrieve relevant facts and observations for a query, then reinforce
    /// what was returned. Reinforcement runs after the search so it never
    /// sits on the read path.
    pub async fn recall(&self, query: &str, limit: Option<usize>) -> Result<FactContext> {
        let embedding = self.embed(query).await?;
        let limit = limit.unwrap_or(self.config.retrieval.default_limit);

        let ctx = {
            let conn = self.reader()?;
            retrieval::recall(
                &conn,
                &RecallQuery {
                    text: query,
                    embedding: &embedding,
                    limit,
                },
                &self.config.retrieval,
            )?
        };

        let fact_ids: Vec<&str> = ctx.facts.iter().map(|f| f.fact.id.as_str()).collect();
        let obs_ids: Vec<&str> = ctx
            .observations
            .iter()
            .map(|o| o.observation.id.as_str())
            .collect();
        {
            let conn = self.writer()?;
            facts::reinforce(&conn, &fact_ids)?;
            observations::reinforce(&conn, &obs_ids)?;
        }

        Ok(ctx)
    }

    /// Delete a fact. Its entity refs and links go with it. Returns false if
    /// the fact did not exist.
    pub async fn forget(&self, fact_id: &str) -> Result<bool> {
        let deleted = {
            let mut conn = self.writer()?;
            facts::delete_fact(&mut conn, fact_id)?
        };
        if deleted {
            self.emit(MemoryEvent::FactDeleted {
                fact_id: fact_id.to_string(),
            });
        }
        Ok(deleted)
    }

    /// Replace a fact's text: re-embed, rewrite the indexes, drop its old
    /// links, and re-link from scratch. Entity refs are kept as recorded.
    pub async fn update_fact(&self, fact_id: &str, new_text: &str) -> Result<bool> {
        let embedding = self.embed(new_text).await?;
        {
            let mut conn = self.writer()?;
            if !facts::update_text(&mut conn, fact_id, new_text, &embedding)? {
                return Ok(false);
            }
            linker::delete_links_for_fact(&conn, fact_id)?;
        }

        let fact = {
            let conn = self.reader()?;
            facts::get_fact(&conn, fact_id)?
        };
        if let Some(fact) = fact {
            let links = {
                let conn = self.reader()?;
                linker::link_fact(&conn, &fact, &embedding, &self.config.linking)?
            };
            let mut conn = self.writer()?;
            linker::persist_links(&mut conn, &links)?;
        }

        self.emit(MemoryEvent::FactUpdated {
            fact_id: fact_id.to_string(),
        });
        Ok(true)
    }

    /// Wipe everything.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut conn = self.writer()?;
            facts::clear_all(&mut conn)?;
        }
        tracing::info!("memory cleared");
        self.emit(MemoryEvent::MemoryCleared);
        Ok(())
    }

    /// One consolidation pass over the next batch of eligible facts.
    ///
    /// Per fact: gather similar observations under the reader, ask the model
    /// with no lock held, embed any new summary, then commit that fact's
    /// outcome under the writer. A model failure marks the fact skipped and
    /// the backoff retries it later.
    pub async fn consolidation_tick(&self) -> Result<TickReport> {
        self.consolidation_tick_cancellable(&CancellationToken::new())
            .await
    }

    /// Like [`Self::consolidation_tick`], but stops between facts (and
    /// abandons an in-flight model call) once `cancel` fires. Unreached facts
    /// stay pending and come up on a later tick, so stopping here is always
    /// safe.
    pub async fn consolidation_tick_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TickReport> {
        let batch = {
            let conn = self.reader()?;
            facts::consolidation_batch(
                &conn,
                self.config.consolidation.batch_size,
                self.config.consolidation.retry_backoff_secs,
            )?
        };

        let mut report = TickReport::default();

        for fact in batch {
            if cancel.is_cancelled() {
                break;
            }
            report.examined += 1;

            let offered = {
                let conn = self.reader()?;
                let Some(fact_embedding) = facts::get_embedding(&conn, &fact.id)? else {
                    continue;
                };
                consolidate::similar_observations(
                    &conn,
                    &fact_embedding,
                    self.config.consolidation.similar_observations,
                )?
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.model.consolidate(&fact.text, &offered) => outcome,
            };
            let decision = match outcome {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(fact = %fact.id, error = %e, "consolidation model call failed");
                    let conn = self.writer()?;
                    facts::mark_skipped(&conn, &fact.id)?;
                    report.failed += 1;
                    continue;
                }
            };

            let summary_embedding = match &decision {
                ConsolidationDecision::Create { summary }
                | ConsolidationDecision::Update { summary, .. } => {
                    Some(self.embed(summary).await?)
                }
                ConsolidationDecision::Skip => None,
            };

            let applied = {
                let mut conn = self.writer()?;
                consolidate::apply_decision(
                    &mut conn,
                    &fact,
                    &decision,
                    summary_embedding.as_deref(),
                    &offered,
                )?
            };
            match applied {
                Applied::Created { .. } | Applied::Updated { .. } => report.consolidated += 1,
                Applied::Skipped => report.skipped += 1,
            }
        }

        Ok(report)
    }

    /// Row counts across the core tables.
    pub fn stats(&self) -> Result<MemoryStats> {
        let conn = self.reader()?;
        let count = |table: &str| -> Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| {
                r.get(0)
            })?;
            Ok(n as u64)
        };
        Ok(MemoryStats {
            facts: count("facts")?,
            observations: count("observations")?,
            entities: count("entities")?,
            links: count("fact_links")?,
        })
    }

    /// Run the embedder off the async threads.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self.embedder.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .context("embedding task panicked")?
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| anyhow::anyhow!("writer lock poisoned"))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| anyhow::anyhow!("reader lock poisoned"))
    }

    fn emit(&self, event: MemoryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
