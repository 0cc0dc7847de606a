//! Error types for graph-memory

use thiserror::Error;

use crate::node::EpisodeId;

/// Errors that can occur in the memory system
#[derive(Debug, Error)]
pub enum MemoryError {
    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Store failure reported by a non-RocksDB backend
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// MessagePack encoding error
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// UUID parsing error
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Embedding or extraction client failed
    #[error("Collaborator error in {operation}: {message}")]
    Collaborator { operation: String, message: String },

    /// Collaborator answered with a payload that does not fit the schema
    #[error("Malformed output from {operation}: {message}")]
    MalformedOutput { operation: String, message: String },

    /// Bounded retry gave up
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<MemoryError>,
    },

    /// Invalid input or invariant violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The episode was stored but extraction failed afterwards
    #[error("Episode {episode_id} stored but resolution failed: {source}")]
    Ingestion {
        episode_id: EpisodeId,
        #[source]
        source: Box<MemoryError>,
    },

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Create a collaborator error
    pub fn collaborator(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a malformed output error
    pub fn malformed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether a bounded retry may help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Collaborator { .. } | Self::MalformedOutput { .. }
        )
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_display() {
        let err = MemoryError::collaborator("extract_entities", "timeout");
        assert_eq!(
            err.to_string(),
            "Collaborator error in extract_entities: timeout"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(MemoryError::collaborator("embed", "503").is_retryable());
        assert!(MemoryError::malformed("structured_output", "missing field").is_retryable());
        assert!(!MemoryError::store("disk full").is_retryable());
        assert!(!MemoryError::validation("bad").is_retryable());
    }

    #[test]
    fn test_ingestion_error_keeps_episode_id() {
        let id = EpisodeId::new();
        let err = MemoryError::Ingestion {
            episode_id: id,
            source: Box::new(MemoryError::collaborator("extract_entities", "down")),
        };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
