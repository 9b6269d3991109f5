//! Language-model integration.
//!
//! The engine asks a model two things: which entities a fact mentions, and
//! whether a fact should fold into an observation. [`LanguageModel`] is the
//! seam; [`openai::OpenAiModel`] talks to any OpenAI-compatible
//! chat-completions endpoint. Responses are parsed tolerantly: model output
//! that is not valid JSON degrades to "no entities" or "skip" rather than
//! failing the calling operation.

pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// One entity mention extracted from fact text.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntityMention {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

/// An existing observation offered to the model as a consolidation target.
#[derive(Debug, Clone)]
pub struct ObservationSummary {
    pub id: String,
    pub summary: String,
}

/// The model's verdict on one fact.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationDecision {
    /// Start a new observation with this summary.
    Create { summary: String },
    /// Fold the fact into an existing observation, replacing its summary.
    Update {
        observation_id: String,
        summary: String,
    },
    /// The fact does not generalize (yet). Revisited after a backoff.
    Skip,
}

/// Model operations the engine depends on. Implementations must be safe to
/// call concurrently; the engine never holds a database lock across these
/// calls.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Extract the entities mentioned in a piece of fact text.
    async fn extract_entities(&self, text: &str) -> Result<Vec<EntityMention>>;

    /// Decide whether `fact_text` should create a new observation, update one
    /// of `similar`, or be skipped.
    async fn consolidate(
        &self,
        fact_text: &str,
        similar: &[ObservationSummary],
    ) -> Result<ConsolidationDecision>;
}

pub(crate) const EXTRACTION_PROMPT: &str = r#"Extract the named entities from this statement. Output a JSON array.

For each entity:
- "name": the entity's name as written
- "type": one of: person, organization, place, project, thing

Only include concrete named things. If there are none, return an empty array: []

Statement:
{text}

Output JSON array only, no explanation:"#;

pub(crate) const CONSOLIDATION_PROMPT: &str = r#"You maintain a set of observations: short generalizations distilled from atomic facts.

Given a new fact and the most similar existing observations, decide one of:
- "create": the fact starts a pattern no observation covers. Provide a summary.
- "update": the fact strengthens an existing observation. Provide its id and a revised summary covering the new evidence.
- "skip": the fact is too specific or one-off to generalize.

New fact:
{fact}

Existing observations:
{observations}

Output one JSON object only, no explanation:
{"action": "create" | "update" | "skip", "summary": "...", "observation_id": "..."}"#;

/// Fill the extraction prompt.
pub(crate) fn extraction_prompt(text: &str) -> String {
    EXTRACTION_PROMPT.replace("{text}", text)
}

/// Fill the consolidation prompt with the fact and candidate observations.
pub(crate) fn consolidation_prompt(fact_text: &str, similar: &[ObservationSummary]) -> String {
    let observations = if similar.is_empty() {
        "(none)".to_string()
    } else {
        similar
            .iter()
            .map(|o| format!("- id: {}\n  summary: {}", o.id, o.summary))
            .collect::<Vec<_>>()
            .join("\n")
    };
    CONSOLIDATION_PROMPT
        .replace("{fact}", fact_text)
        .replace("{observations}", &observations)
}

/// Parse extracted entity mentions. Handles markdown code fences and
/// surrounding prose; anything unparseable yields an empty list so a bad
/// model response never fails the remember path.
pub fn parse_entity_mentions(response: &str) -> Vec<EntityMention> {
    let Some(json) = slice_between(response, '[', ']') else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<EntityMention>>(json) {
        Ok(mentions) => mentions
            .into_iter()
            .filter(|m| !m.name.trim().is_empty())
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "unparseable entity extraction response");
            Vec::new()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    observation_id: Option<String>,
}

/// Parse a consolidation decision. Malformed output degrades to
/// [`ConsolidationDecision::Skip`], which the backoff will retry later.
pub fn parse_consolidation_decision(response: &str) -> ConsolidationDecision {
    let Some(json) = slice_between(response, '{', '}') else {
        tracing::warn!("consolidation response contained no JSON object");
        return ConsolidationDecision::Skip;
    };
    let raw: RawDecision = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable consolidation response");
            return ConsolidationDecision::Skip;
        }
    };

    match raw.action.as_str() {
        "create" => match raw.summary.filter(|s| !s.trim().is_empty()) {
            Some(summary) => ConsolidationDecision::Create { summary },
            None => {
                tracing::warn!("create decision without summary, treating as skip");
                ConsolidationDecision::Skip
            }
        },
        "update" => match (
            raw.observation_id.filter(|s| !s.trim().is_empty()),
            raw.summary.filter(|s| !s.trim().is_empty()),
        ) {
            (Some(observation_id), Some(summary)) => ConsolidationDecision::Update {
                observation_id,
                summary,
            },
            _ => {
                tracing::warn!("update decision missing id or summary, treating as skip");
                ConsolidationDecision::Skip
            }
        },
        "skip" => ConsolidationDecision::Skip,
        other => {
            tracing::warn!(action = other, "unknown consolidation action, treating as skip");
            ConsolidationDecision::Skip
        }
    }
}

/// Slice out the outermost `open`..`close` span, tolerating code fences and
/// prose around it.
fn slice_between(response: &str, open: char, close: char) -> Option<&str> {
    let start = response.find(open)?;
    let end = response.rfind(close)?;
    (end >= start).then(|| &response[start..=end])
}
