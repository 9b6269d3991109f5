//! Chat-completions client for OpenAI-compatible endpoints.
//!
//! Handles auth, timeouts, and a single retry on transient errors (429 and
//! 5xx). Anything speaking the `/chat/completions` wire format works, which
//! covers local inference servers as well as the hosted APIs.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    consolidation_prompt, extraction_prompt, parse_consolidation_decision, parse_entity_mentions,
    ConsolidationDecision, EntityMention, LanguageModel, ObservationSummary,
};
use crate::config::ModelConfig;

const MAX_RETRIES: u32 = 1;

pub struct OpenAiModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl OpenAiModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// One chat turn, returning the assistant text. Retries once on 429/5xx
    /// after a short delay.
    async fn chat(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let mut last_status = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tracing::warn!(attempt, "retrying model request after transient error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await
                .context("model request failed")?;

            let status = response.status();
            if status.is_success() {
                let parsed: ChatResponse = response
                    .json()
                    .await
                    .context("malformed chat-completions response")?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                return Ok(content);
            }

            let transient = status.as_u16() == 429 || status.is_server_error();
            if transient && attempt < MAX_RETRIES {
                last_status = Some(status);
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("model endpoint returned {status}: {body}");
        }

        anyhow::bail!(
            "model request failed after retries (last status: {})",
            last_status.map_or_else(|| "none".into(), |s| s.to_string())
        )
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn extract_entities(&self, text: &str) -> Result<Vec<EntityMention>> {
        let response = self.chat(&extraction_prompt(text)).await?;
        Ok(parse_entity_mentions(&response))
    }

    async fn consolidate(
        &self,
        fact_text: &str,
        similar: &[ObservationSummary],
    ) -> Result<ConsolidationDecision> {
        let response = self.chat(&consolidation_prompt(fact_text, similar)).await?;
        Ok(parse_consolidation_decision(&response))
    }
}
