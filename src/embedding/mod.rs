//! Text embedding layer.
//!
//! Facts, observations, and entity names are all embedded with the same
//! provider so their vectors live in one space. The default provider runs
//! all-MiniLM-L6-v2 locally through ONNX Runtime; vectors are 384-dim and
//! L2-normalized.

pub mod local;

use anyhow::Result;

/// Embedding width for all-MiniLM-L6-v2. The vec0 tables are declared with
/// this dimension, so it is fixed for the lifetime of a database.
pub const EMBEDDING_DIM: usize = 384;

/// Produces L2-normalized vectors of exactly [`EMBEDDING_DIM`] dimensions.
///
/// Methods are synchronous and may be CPU-heavy; async callers should wrap
/// them in `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Batched embedding. The default embeds one at a time; implementations
    /// with real batch inference should override.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Build the configured provider. Only `"local"` exists today; it fails with
/// a pointer to `mnemon model download` when the model files are missing.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(local::LocalEmbedder::new(config)?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local"),
    }
}
