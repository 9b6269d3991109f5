use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MnemonConfig {
    pub log_level: String,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub model: ModelConfig,
    pub retrieval: RetrievalConfig,
    pub linking: LinkingConfig,
    pub resolution: ResolutionConfig,
    pub consolidation: ConsolidationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

/// Language-model endpoint used for entity extraction and consolidation
/// decisions. Any OpenAI-compatible chat-completions server works.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Default `k` when the caller doesn't specify one.
    pub default_limit: usize,
    /// RRF rank constant.
    pub rrf_k: usize,
    /// Cosine similarity floor for vector seed candidates.
    pub min_similarity: f64,
    /// Maximum facts discovered by graph expansion.
    pub graph_frontier_limit: usize,
    /// Maximum hops away from the fused seed set.
    pub graph_max_hops: usize,
    /// Per-hour decay base for the recency/usage score adjustment.
    pub decay_rate: f64,
    /// How many observations to return per recall.
    pub observation_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LinkingConfig {
    /// Links below this weight are discarded, bounding graph density.
    pub min_weight: f64,
    /// Half-life (hours) for temporal link weights.
    pub temporal_half_life_hours: f64,
    /// How many most-recent facts are considered temporal neighbors.
    pub temporal_candidates: usize,
    /// Cosine similarity floor for semantic links.
    pub semantic_threshold: f64,
    /// KNN fan-out for semantic link candidates.
    pub semantic_candidates: usize,
    /// At most this many entity edges per shared canonical entity.
    pub entity_candidates: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Score at or above which a mention merges into an existing entity.
    pub auto_merge_threshold: f64,
    /// Candidate fan-out per signal (by type, by name-vector KNN).
    pub candidate_limit: usize,
    /// Half-life (hours) for the temporal-proximity signal.
    pub temporal_half_life_hours: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub enabled: bool,
    /// Seconds between consolidation ticks.
    pub interval_secs: u64,
    /// Facts examined per tick.
    pub batch_size: usize,
    /// How long a skipped fact waits before the tick loop retries it.
    pub retry_backoff_secs: u64,
    /// How many similar observations are offered to the model per decision.
    pub similar_observations: usize,
}

impl Default for MnemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            model: ModelConfig::default(),
            retrieval: RetrievalConfig::default(),
            linking: LinkingConfig::default(),
            resolution: ResolutionConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_mnemon_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_mnemon_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: String::new(),
            timeout_secs: 60,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            rrf_k: 60,
            min_similarity: 0.25,
            graph_frontier_limit: 50,
            graph_max_hops: 2,
            decay_rate: 0.99,
            observation_limit: 3,
        }
    }
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            min_weight: 0.1,
            temporal_half_life_hours: 24.0,
            temporal_candidates: 10,
            semantic_threshold: 0.75,
            semantic_candidates: 20,
            entity_candidates: 50,
        }
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            auto_merge_threshold: 0.85,
            candidate_limit: 50,
            temporal_half_life_hours: 168.0,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            batch_size: 10,
            retry_backoff_secs: 3600,
            similar_observations: 5,
        }
    }
}

/// Returns `~/.mnemon/`
pub fn default_mnemon_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".mnemon")
}

/// Returns the default config file path: `~/.mnemon/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mnemon_dir().join("config.toml")
}

impl MnemonConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MnemonConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (MNEMON_DB, MNEMON_LOG_LEVEL, MNEMON_MODEL_API_KEY).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMON_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MNEMON_LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = std::env::var("MNEMON_MODEL_API_KEY") {
            self.model.api_key = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MnemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.retrieval.graph_frontier_limit, 50);
        assert!((config.resolution.auto_merge_threshold - 0.85).abs() < 1e-9);
        assert!(config.linking.min_weight > 0.0);
        assert!(config.storage.db_path.ends_with("memory.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[retrieval]
default_limit = 20

[resolution]
auto_merge_threshold = 0.9
"#;
        let config: MnemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.retrieval.default_limit, 20);
        assert!((config.resolution.auto_merge_threshold - 0.9).abs() < 1e-9);
        // defaults still apply for unset fields
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.consolidation.batch_size, 10);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = MnemonConfig::default();
        std::env::set_var("MNEMON_DB", "/tmp/override.db");
        std::env::set_var("MNEMON_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.log_level, "trace");

        // Clean up
        std::env::remove_var("MNEMON_DB");
        std::env::remove_var("MNEMON_LOG_LEVEL");
    }
}
