//! Core memory engine: repositories, entity resolution, fact linking, hybrid
//! retrieval, consolidation, and the [`engine::FactMemory`] facade.

pub mod consolidate;
pub mod engine;
pub mod entities;
pub mod facts;
pub mod linker;
pub mod observations;
pub mod resolver;
pub mod retrieval;
pub mod types;

pub use engine::FactMemory;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Decode a stored embedding blob back into an f32 vector, re-normalizing to
/// unit length. Stored vectors are always treated as unit-normalized on read,
/// so small storage drift cannot accumulate (re-normalizing twice is a no-op).
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    let mut v: Vec<f32> = bytes
        .chunks_exact(std::mem::size_of::<f32>())
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity between two vectors. Returns 0.0 if either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}

/// Convert a cosine-similarity threshold to the equivalent L2 distance for
/// unit vectors: `d = sqrt(2 * (1 - cos))`. sqlite-vec KNN returns L2
/// distances, so thresholds expressed as similarities must cross this bridge.
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).max(0.0).sqrt()
}

/// Inverse of [`cosine_threshold_to_l2`]: similarity implied by an L2
/// distance between unit vectors.
pub fn l2_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}
