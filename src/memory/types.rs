//! Core domain type definitions.
//!
//! Defines [`FactType`] and [`LinkType`] (the tagged enums persisted as TEXT),
//! the domain records ([`Fact`], [`Observation`], [`Entity`], [`EntityRef`],
//! [`FactLink`]), the [`FactContext`] recall result, and [`MemoryEvent`]
//! emitted on every mutation.

use serde::{Deserialize, Serialize};

/// The two fact categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    /// Statements about the world ("User works at Acme").
    World,
    /// First-person experiences and events ("Met Dana at the standup").
    Experience,
}

impl FactType {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::World => "world",
            Self::Experience => "experience",
        }
    }
}

impl std::fmt::Display for FactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "world" => Ok(Self::World),
            "experience" => Ok(Self::Experience),
            _ => Err(format!("unknown fact type: {s}")),
        }
    }
}

/// How an edge between two facts was derived.
///
/// A single tagged enum rather than per-type tables, so graph traversal can
/// treat all edges uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Created close in time; weight decays with the time delta.
    Temporal,
    /// High embedding cosine similarity; weight is the similarity.
    Semantic,
    /// Shared canonical entity; weight is IDF-style, rare entities bind tighter.
    Entity,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temporal => "temporal",
            Self::Semantic => "semantic",
            Self::Entity => "entity",
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporal" => Ok(Self::Temporal),
            "semantic" => Ok(Self::Semantic),
            "entity" => Ok(Self::Entity),
            _ => Err(format!("unknown link type: {s}")),
        }
    }
}

/// Lifecycle of a fact with respect to consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationState {
    /// Not yet examined by the consolidator.
    Pending,
    /// Folded into an observation.
    Done,
    /// The model declined (or failed); retried after a backoff.
    Skipped,
}

impl ConsolidationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for ConsolidationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("unknown consolidation state: {s}")),
        }
    }
}

/// An atomic stored fact, matching the `facts` table schema.
///
/// Immutable by convention: after creation only `access_count`,
/// consolidation bookkeeping, and text-on-edit change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    /// The verbatim fact text.
    pub text: String,
    #[serde(rename = "type")]
    pub fact_type: FactType,
    /// Where this fact came from (e.g. `"manual"`, `"notes"`, `"mail"`).
    pub source_type: String,
    /// Opaque reference into the source (document id, message id), if any.
    pub source_ref: Option<String>,
    pub consolidation: ConsolidationState,
    /// Set when the consolidator folds this fact into an observation.
    pub consolidated_at: Option<String>,
    /// Number of times this fact has been returned by recall.
    pub access_count: u32,
    pub last_accessed: Option<String>,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
}

/// A synthesized generalization distilled from facts by the consolidator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub summary: String,
    /// Cardinality of the evidence set at the last write. May drift after
    /// later fact deletions; this is accepted, not corrected.
    pub evidence_count: u32,
    pub access_count: u32,
    pub last_accessed: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A canonical, deduplicated named thing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub created_at: String,
}

/// A mention of an entity inside one fact, as written in the text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRef {
    pub fact_id: String,
    pub name: String,
    pub entity_type: String,
    /// The canonical entity this mention resolved to; `None` while unresolved.
    pub canonical_id: Option<String>,
}

/// A weighted edge between two facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactLink {
    pub source_fact_id: String,
    pub target_fact_id: String,
    pub link_type: LinkType,
    /// Always in `(0, 1]`; links under the minimum-weight cutoff are never
    /// persisted.
    pub weight: f64,
}

/// A recalled fact with its retrieval score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredFact {
    #[serde(flatten)]
    pub fact: Fact,
    pub score: f64,
}

/// A recalled observation with its retrieval score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredObservation {
    #[serde(flatten)]
    pub observation: Observation,
    pub score: f64,
}

/// Result of a recall query: ranked facts plus relevant observations.
#[derive(Debug, Default, Serialize)]
pub struct FactContext {
    pub facts: Vec<ScoredFact>,
    pub observations: Vec<ScoredObservation>,
}

/// Domain events emitted by the facade on every mutation, for subscribers
/// that mirror or audit the store. Delivery is best-effort.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MemoryEvent {
    FactCreated { fact_id: String },
    FactUpdated { fact_id: String },
    FactDeleted { fact_id: String },
    MemoryCleared,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn fact_type_round_trips() {
        for t in [FactType::World, FactType::Experience] {
            assert_eq!(FactType::from_str(t.as_str()).unwrap(), t);
        }
        assert!(FactType::from_str("semantic").is_err());
    }

    #[test]
    fn link_type_round_trips() {
        for t in [LinkType::Temporal, LinkType::Semantic, LinkType::Entity] {
            assert_eq!(LinkType::from_str(t.as_str()).unwrap(), t);
        }
        assert!(LinkType::from_str("causal").is_err());
    }

    #[test]
    fn consolidation_state_round_trips() {
        for s in [
            ConsolidationState::Pending,
            ConsolidationState::Done,
            ConsolidationState::Skipped,
        ] {
            assert_eq!(ConsolidationState::from_str(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = MemoryEvent::FactCreated {
            fact_id: "f1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "fact_created");
        assert_eq!(json["fact_id"], "f1");
    }
}
