//! Embedding collaborators for semantic search
//!
//! The [`Embedder`] trait is the seam to whatever produces vectors. A
//! deployment uses one fixed dimensionality. [`CachedEmbedder`] memoizes any
//! embedder; the `fastembed` feature adds a local ONNX model.

mod engine;
#[cfg(feature = "fastembed")]
mod discovery;
#[cfg(feature = "fastembed")]
mod local;

use async_trait::async_trait;

use crate::error::Result;

pub use engine::CachedEmbedder;
#[cfg(feature = "fastembed")]
pub use discovery::find_model_cache_dir;
#[cfg(feature = "fastembed")]
pub use local::{FastEmbedConfig, FastEmbedder};

/// Text-to-vector client
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts in one call, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Vector dimensionality
    fn dimension(&self) -> usize;
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
