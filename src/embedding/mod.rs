//! Embedding providers and vector math
//!
//! Two backends:
//! - `HashingEmbedder`: feature-hashing fallback, no external dependencies,
//!   deterministic. Default for tests and offline operation.
//! - `OpenAIEmbedder`: OpenAI-compatible HTTP API, behind the `openai`
//!   feature. Distinguishes transient (429/5xx) from content errors.
//!
//! All providers are batch-first; the memory store chunks its own batches
//! and wraps calls in a timeout.

mod hashing;
#[cfg(feature = "openai")]
mod openai;

pub use hashing::HashingEmbedder;
#[cfg(feature = "openai")]
pub use openai::OpenAIEmbedder;

use async_trait::async_trait;

use crate::error::Result;

/// Batch text -> fixed-dimension float vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts, one vector per text,
    /// in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vecs = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vecs.pop()
            .ok_or_else(|| crate::error::SpotterError::Embedding("empty batch result".into()))
    }

    /// Embedding dimensions
    fn dimensions(&self) -> usize;

    /// Model identifier stored alongside each vector
    fn model_id(&self) -> &str;
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
