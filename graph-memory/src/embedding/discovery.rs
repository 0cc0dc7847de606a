//! Model cache discovery
//!
//! Finds where local embedding models are stored across installation
//! scenarios.

use std::path::{Path, PathBuf};

/// Directory name fastembed uses when nothing else is configured
const DEFAULT_CACHE_DIR: &str = ".fastembed_cache";

/// Find the model cache directory with priority:
/// 1. Explicit path from configuration
/// 2. GRAPH_MEMORY_MODELS_PATH environment variable
/// 3. FASTEMBED_CACHE_PATH environment variable
/// 4. User home directory (~/.graph-memory/models)
/// 5. `.fastembed_cache` in the working directory
pub fn find_model_cache_dir(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        tracing::info!("Using configured model cache: {}", path.display());
        return path.to_path_buf();
    }

    for var in ["GRAPH_MEMORY_MODELS_PATH", "FASTEMBED_CACHE_PATH"] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                tracing::info!("Using {}: {}", var, value);
                return PathBuf::from(value);
            }
        }
    }

    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        let user_path = PathBuf::from(home).join(".graph-memory").join("models");
        if user_path.is_dir() {
            tracing::info!("Using user model cache: {}", user_path.display());
            return user_path;
        }
    }

    PathBuf::from(DEFAULT_CACHE_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_path_wins() {
        let path = Path::new("/tmp/models-under-test");
        assert_eq!(find_model_cache_dir(Some(path)), path.to_path_buf());
    }

    #[test]
    fn test_fallback_is_never_empty() {
        let dir = find_model_cache_dir(None);
        assert!(!dir.as_os_str().is_empty());
    }
}
