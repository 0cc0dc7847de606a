//! Local embeddings via fastembed
//!
//! Runs BGE-Small-EN-v1.5 (384 dimensions) through ONNX Runtime on the host.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;

use super::discovery::find_model_cache_dir;
use super::Embedder;
use crate::error::{MemoryError, Result};

/// fastembed configuration
#[derive(Debug, Clone)]
pub struct FastEmbedConfig {
    /// Where model files are cached (discovered when unset)
    pub cache_dir: Option<PathBuf>,
    /// Maximum sequence length (default: 512)
    pub max_length: usize,
    /// Batch size for encoding (default: 256)
    pub batch_size: usize,
}

impl Default for FastEmbedConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_length: 512,
            batch_size: 256,
        }
    }
}

/// fastembed model wrapper
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    config: FastEmbedConfig,
    dimension: usize,
}

impl FastEmbedder {
    /// Load the default model, downloading it into the cache if needed
    pub fn new(config: FastEmbedConfig) -> Result<Self> {
        let cache_dir = find_model_cache_dir(config.cache_dir.as_deref());
        tracing::info!("Loading fastembed model from: {}", cache_dir.display());

        let options = InitOptions::new(EmbeddingModel::BGESmallENV15)
            .with_cache_dir(cache_dir)
            .with_max_length(config.max_length)
            .with_show_download_progress(false);
        let model = TextEmbedding::try_new(options)
            .map_err(|e: anyhow::Error| MemoryError::collaborator("load_model", e.to_string()))?;

        let sample = model
            .embed(vec!["test"], None)
            .map_err(|e: anyhow::Error| MemoryError::collaborator("embed", e.to_string()))?;
        let dimension = sample.first().map(Vec::len).unwrap_or_default();

        tracing::info!(
            "Loaded fastembed model ({}d, max {} tokens)",
            dimension,
            config.max_length
        );

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            config,
            dimension,
        })
    }

    async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let batch_size = self.config.batch_size;
        tokio::task::spawn_blocking(move || {
            model
                .lock()
                .embed(texts, Some(batch_size))
                .map_err(|e: anyhow::Error| MemoryError::collaborator("embed", e.to_string()))
        })
        .await
        .map_err(|e| MemoryError::collaborator("embed", e.to_string()))?
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.run(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::malformed("embed", "model returned no vector"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.run(texts.to_vec()).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
