//! Caching embedding wrapper
//!
//! Memoizes vectors per input text so repeated names and facts hit the
//! model once.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::Embedder;
use crate::error::{MemoryError, Result};

/// Embedder with a DashMap cache in front of it
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: DashMap<String, Vec<f32>>,
    dimension: usize,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        let dimension = inner.dimension();
        Self {
            inner,
            cache: DashMap::new(),
            dimension,
        }
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::malformed(
                "embed",
                format!(
                    "embedding has {} dimensions, expected {}",
                    vector.len(),
                    self.dimension
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    /// Generate embedding with caching
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.inner.embed(text).await?;
        self.check_dimension(&embedding)?;
        self.cache.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// Batch embed, sending only uncached texts to the model
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = texts
            .iter()
            .map(|text| self.cache.get(text).map(|v| v.clone()))
            .collect();

        let uncached: Vec<(usize, String)> = results
            .iter()
            .enumerate()
            .filter(|(_, cached)| cached.is_none())
            .map(|(i, _)| (i, texts[i].clone()))
            .collect();

        if uncached.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        let uncached_texts: Vec<String> = uncached.iter().map(|(_, t)| t.clone()).collect();
        let new_embeddings = self.inner.embed_batch(&uncached_texts).await?;
        if new_embeddings.len() != uncached_texts.len() {
            return Err(MemoryError::malformed(
                "embed_batch",
                format!(
                    "got {} vectors for {} texts",
                    new_embeddings.len(),
                    uncached_texts.len()
                ),
            ));
        }

        for ((idx, text), emb) in uncached.into_iter().zip(new_embeddings) {
            self.check_dimension(&emb)?;
            self.cache.insert(text, emb.clone());
            results[idx] = Some(emb);
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HashEmbedder;

    #[tokio::test]
    async fn test_cache_hits_skip_inner_model() {
        let inner = Arc::new(HashEmbedder::new(32));
        let cached = CachedEmbedder::new(inner.clone());

        let a = cached.embed("alice").await.unwrap();
        let b = cached.embed("alice").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(inner.calls(), 1);
        assert_eq!(cached.cache_size(), 1);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_fills_cache() {
        let inner = Arc::new(HashEmbedder::new(32));
        let cached = CachedEmbedder::new(inner.clone());
        cached.embed("bob").await.unwrap();

        let texts = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
        let batch = cached.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[1], cached.embed("bob").await.unwrap());
        assert_eq!(cached.cache_size(), 3);

        cached.clear_cache();
        assert_eq!(cached.cache_size(), 0);
    }
}
