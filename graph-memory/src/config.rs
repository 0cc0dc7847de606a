//! Memory configuration
//!
//! [`MemoryConfig`] groups the tunables of every component. Defaults are
//! usable as-is; `from_env` overlays `GRAPH_MEMORY_*` variables and
//! `from_json_file` reads a full or partial JSON document.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cascade::CascadeConfig;
use crate::error::{MemoryError, Result};
use crate::pruner::PruneOptions;
use crate::resolver::{ExtractionStrategy, ResolverConfig};
use crate::retry::RetryPolicy;
use crate::search::{SearchConfig, SearchStrategy};

const ENV_PREFIX: &str = "GRAPH_MEMORY_";

/// Episode ingestion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Identical content for the same owner within this window is a duplicate (default: 24)
    pub dedup_window_hours: i64,
    /// Cosine similarity above which episode content counts as near-identical (default: 0.98)
    pub episode_dedup_threshold: f32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_window_hours: 24,
            episode_dedup_threshold: 0.98,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub resolver: ResolverConfig,
    pub cascade: CascadeConfig,
    pub search: SearchConfig,
    pub ingest: IngestConfig,
    pub retry: RetryPolicy,
    pub prune: PruneOptions,
    /// BM25 side file; `None` keeps the index in memory only
    pub index_path: Option<PathBuf>,
    /// Disable to run keyword-only (no embedding calls)
    pub embeddings_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            cascade: CascadeConfig::default(),
            search: SearchConfig::default(),
            ingest: IngestConfig::default(),
            retry: RetryPolicy::default(),
            prune: PruneOptions::default(),
            index_path: None,
            embeddings_enabled: true,
        }
    }
}

impl MemoryConfig {
    /// Defaults overlaid with `GRAPH_MEMORY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Read a JSON document; missing keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!("Loaded memory config from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from a variable lookup, then validate
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("ENTITY_THRESHOLD") {
            self.resolver.entity_threshold = parse("ENTITY_THRESHOLD", &v)?;
        }
        if let Some(v) = var("FACT_THRESHOLD") {
            self.resolver.fact_threshold = parse("FACT_THRESHOLD", &v)?;
        }
        if let Some(v) = var("CONTEXT_EPISODES") {
            self.resolver.context_episodes = parse("CONTEXT_EPISODES", &v)?;
        }
        if let Some(v) = var("EXTRACTION") {
            self.resolver.strategy = match v.to_ascii_lowercase().as_str() {
                "standard" => ExtractionStrategy::Standard,
                "cascade" => ExtractionStrategy::Cascade,
                other => {
                    return Err(MemoryError::config(format!(
                        "unknown extraction strategy: {}",
                        other
                    )))
                }
            };
        }
        if let Some(v) = var("CASCADE_ROUNDS") {
            self.cascade.rounds = parse("CASCADE_ROUNDS", &v)?;
        }
        if let Some(v) = var("SEARCH_STRATEGY") {
            self.search.strategy = SearchStrategy::from_str(&v)?;
        }
        if let Some(v) = var("SEARCH_LIMIT") {
            self.search.limit = parse("SEARCH_LIMIT", &v)?;
        }
        if let Some(v) = var("RRF_K") {
            self.search.rrf_k = parse("RRF_K", &v)?;
        }
        if let Some(v) = var("DEDUP_WINDOW_HOURS") {
            self.ingest.dedup_window_hours = parse("DEDUP_WINDOW_HOURS", &v)?;
        }
        if let Some(v) = var("RETRY_ATTEMPTS") {
            self.retry.max_attempts = parse("RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("INDEX_PATH") {
            self.index_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("EMBEDDINGS") {
            self.embeddings_enabled = parse_bool("EMBEDDINGS", &v)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values outside their meaningful range
    pub fn validate(&self) -> Result<()> {
        unit("resolver.entity_threshold", self.resolver.entity_threshold)?;
        unit("resolver.fact_threshold", self.resolver.fact_threshold)?;
        unit("ingest.episode_dedup_threshold", self.ingest.episode_dedup_threshold)?;
        unit("search.semantic_threshold", self.search.semantic_threshold)?;
        unit("prune.similarity_threshold", self.prune.similarity_threshold)?;

        if self.cascade.rounds == 0 {
            return Err(MemoryError::config("cascade.rounds must be at least 1"));
        }
        if self.search.rrf_k <= 0.0 {
            return Err(MemoryError::config("search.rrf_k must be positive"));
        }
        if self.search.limit == 0 {
            return Err(MemoryError::config("search.limit must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(MemoryError::config("retry.max_attempts must be at least 1"));
        }
        if self.ingest.dedup_window_hours < 0 {
            return Err(MemoryError::config("ingest.dedup_window_hours is negative"));
        }
        self.prune
            .validate()
            .map_err(|e| MemoryError::config(format!("prune: {}", e)))?;
        Ok(())
    }
}

fn unit(field: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MemoryError::config(format!(
            "{} must be within [0, 1], got {}",
            field, value
        )))
    }
}

fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        MemoryError::config(format!("{}{}={:?}: {}", ENV_PREFIX, name, raw, e))
    })
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(MemoryError::config(format!(
            "{}{}={:?} is not a boolean",
            ENV_PREFIX, name, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let config = MemoryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.resolver.entity_threshold, 0.7);
        assert_eq!(config.resolver.fact_threshold, 0.8);
        assert_eq!(config.cascade.rounds, 2);
        assert_eq!(config.search.rrf_k, 60.0);
        assert!(config.embeddings_enabled);
    }

    #[test]
    fn test_overlay_reads_prefixed_vars() {
        let config = MemoryConfig::default()
            .overlay(lookup(&[
                ("GRAPH_MEMORY_ENTITY_THRESHOLD", "0.65"),
                ("GRAPH_MEMORY_EXTRACTION", "Cascade"),
                ("GRAPH_MEMORY_SEARCH_STRATEGY", "bm25"),
                ("GRAPH_MEMORY_EMBEDDINGS", "off"),
                ("GRAPH_MEMORY_INDEX_PATH", "/tmp/bm25.idx"),
            ]))
            .unwrap();
        assert_eq!(config.resolver.entity_threshold, 0.65);
        assert_eq!(config.resolver.strategy, ExtractionStrategy::Cascade);
        assert_eq!(config.search.strategy, SearchStrategy::Bm25);
        assert!(!config.embeddings_enabled);
        assert_eq!(config.index_path, Some(PathBuf::from("/tmp/bm25.idx")));
    }

    #[test]
    fn test_overlay_rejects_out_of_range() {
        let err = MemoryConfig::default()
            .overlay(lookup(&[("GRAPH_MEMORY_FACT_THRESHOLD", "1.5")]))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));

        let err = MemoryConfig::default()
            .overlay(lookup(&[("GRAPH_MEMORY_CASCADE_ROUNDS", "many")]))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[test]
    fn test_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(&path, r#"{"cascade": {"rounds": 3}, "embeddings_enabled": false}"#).unwrap();

        let config = MemoryConfig::from_json_file(&path).unwrap();
        assert_eq!(config.cascade.rounds, 3);
        assert!(!config.embeddings_enabled);
        assert_eq!(config.search, SearchConfig::default());
    }
}
