//! Graph Memory
//!
//! Bi-temporal knowledge-graph memory for conversational agents. Raw
//! content is stored as episodes, resolved into deduplicated entities and
//! fact edges, and kept current by invalidating facts that newer content
//! supersedes.
//!
//! ## Features
//!
//! - **Entity resolution** - Embedding similarity merges repeated mentions into one entity
//! - **Bi-temporal facts** - `valid_at`/`invalid_at` plus `created_at`/`expired_at`; history stays queryable
//! - **Hybrid search** - BM25 + semantic + graph traversal, fused by Reciprocal Rank Fusion
//! - **RocksDB persistence** - MessagePack records with an HNSW index for O(log n) search
//!
//! ## Example
//!
//! ```ignore
//! use graph_memory::{GraphMemory, IngestRequest, MemoryConfig, RocksGraphStore, SearchConfig};
//!
//! let store = Arc::new(RocksGraphStore::open(&db_path)?);
//! let memory = GraphMemory::new(store, extractor, Some(embedder), MemoryConfig::from_env()?).await?;
//!
//! memory.ingest(IngestRequest::new("Alice works at Google", "user-1")).await?;
//! memory.ingest(IngestRequest::new("Alice moved to Meta", "user-1")).await?;
//!
//! let results = memory.search("where does Alice work", "user-1", &SearchConfig::default()).await?;
//! ```

pub mod bm25;
pub mod cascade;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extraction;
pub mod invalidation;
pub mod memory;
mod migration;
pub mod node;
pub mod pruner;
pub mod resolver;
pub mod retry;
pub mod search;
pub mod storage;
pub mod temporal;
pub mod testing;

// Re-exports for convenience
pub use bm25::{Bm25Index, Bm25Query, Corpus, TagMatchMode};
pub use cascade::{CascadeConfig, CascadeExtractor, CandidateGraph};
pub use config::{IngestConfig, MemoryConfig};
pub use embedding::{CachedEmbedder, Embedder};
pub use error::{MemoryError, Result};
pub use extraction::{Contradiction, ExtractedEntity, ExtractedRelationship, Extractor};
pub use invalidation::Invalidator;
pub use memory::{GraphMemory, IngestRequest};
pub use node::{
    Entity, EntityId, EntityType, Episode, EpisodeBuilder, EpisodeId, EpisodeSource, EpisodeTag,
    Fact, FactId, Mention, Relation,
};
pub use pruner::{PruneOptions, PruneReport, Pruner};
pub use resolver::{ExtractionStrategy, Resolution, ResolutionContext, Resolver, ResolverConfig};
pub use retry::RetryPolicy;
pub use search::{
    Scored, SearchConfig, SearchEngine, SearchResults, SearchStrategy, TemporalDecay, UpdateBoost,
};
pub use storage::{GraphStore, InMemoryGraphStore, RocksGraphStore, VectorQuery};
pub use temporal::FactTemporal;
