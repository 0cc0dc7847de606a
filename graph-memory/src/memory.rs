//! `GraphMemory` facade
//!
//! Wires the store, collaborators, keyword index and components together
//! and exposes ingestion, search and maintenance to the host.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::instrument;

use crate::bm25::{Bm25Index, Corpus};
use crate::config::MemoryConfig;
use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::extraction::Extractor;
use crate::invalidation::Invalidator;
use crate::node::{Episode, EpisodeId, EpisodeSource, EpisodeTag, FactId};
use crate::pruner::{PruneOptions, PruneReport, Pruner};
use crate::resolver::{ResolutionContext, Resolver};
use crate::retry::with_retry;
use crate::search::{SearchConfig, SearchEngine, SearchResults};
use crate::storage::{GraphStore, VectorQuery};
use crate::temporal::hours_before;

/// One piece of content to ingest
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub text: String,
    pub owner: String,
    pub session: Option<String>,
    pub source: EpisodeSource,
    pub tag: EpisodeTag,
    pub metadata: Map<String, Value>,
    /// When the content became true; defaults to ingestion time
    pub valid_at: Option<DateTime<Utc>>,
}

impl IngestRequest {
    pub fn new(text: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            owner: owner.into(),
            session: None,
            source: EpisodeSource::default(),
            tag: EpisodeTag::default(),
            metadata: Map::new(),
            valid_at: None,
        }
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn source(mut self, source: EpisodeSource) -> Self {
        self.source = source;
        self
    }

    pub fn tag(mut self, tag: EpisodeTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn valid_at(mut self, at: DateTime<Utc>) -> Self {
        self.valid_at = Some(at);
        self
    }
}

/// Knowledge-graph memory
///
/// Every component shares the same store and collaborators. The BM25 index
/// is a derived cache: with `index_path` set it is written back after every
/// mutation, and rebuilt from the store when the side file is missing,
/// unreadable or out of step with the store.
pub struct GraphMemory {
    store: Arc<dyn GraphStore>,
    embedder: Option<Arc<dyn Embedder>>,
    index: Arc<RwLock<Bm25Index>>,
    resolver: Resolver,
    invalidator: Invalidator,
    engine: SearchEngine,
    pruner: Pruner,
    config: MemoryConfig,
}

impl GraphMemory {
    /// Create the facade
    ///
    /// # Arguments
    /// * `store` - Durable graph storage
    /// * `extractor` - LLM-backed extraction client
    /// * `embedder` - Embedding client; ignored when `config.embeddings_enabled` is false
    /// * `config` - Component settings
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the keyword index
    /// cannot be rebuilt from the store.
    pub async fn new(
        store: Arc<dyn GraphStore>,
        extractor: Arc<dyn Extractor>,
        embedder: Option<Arc<dyn Embedder>>,
        config: MemoryConfig,
    ) -> Result<Self> {
        config.validate()?;
        let embedder = embedder.filter(|_| config.embeddings_enabled);
        if embedder.is_none() {
            tracing::info!("Embeddings disabled; running keyword-only");
        }

        let index = Arc::new(RwLock::new(
            Self::load_index(store.as_ref(), config.index_path.as_ref()).await?,
        ));

        let resolver = Resolver::new(
            store.clone(),
            extractor.clone(),
            embedder.clone(),
            config.resolver.clone(),
            config.cascade.clone(),
            config.retry.clone(),
        );
        let invalidator = Invalidator::new(store.clone(), extractor, config.retry.clone());
        let engine = SearchEngine::new(
            store.clone(),
            embedder.clone(),
            index.clone(),
            config.retry.clone(),
        );
        let pruner = Pruner::new(store.clone());

        Ok(Self {
            store,
            embedder,
            index,
            resolver,
            invalidator,
            engine,
            pruner,
            config,
        })
    }

    /// Side file when readable and current, otherwise a rebuild from the store
    async fn load_index(store: &dyn GraphStore, path: Option<&PathBuf>) -> Result<Bm25Index> {
        if let Some(path) = path {
            if path.exists() {
                match Bm25Index::load(path) {
                    Ok(index) if Self::matches_store(&index, store).await? => {
                        tracing::info!("Loaded BM25 index from {}", path.display());
                        return Ok(index);
                    }
                    Ok(_) => {
                        tracing::warn!("BM25 index at {} is stale, rebuilding", path.display())
                    }
                    Err(e) => {
                        tracing::warn!("BM25 index at {} unusable, rebuilding: {}", path.display(), e)
                    }
                }
            }
        }
        let index = Bm25Index::from_store(store).await?;
        if let Some(path) = path {
            if let Err(e) = index.save(path) {
                tracing::warn!("Failed to write rebuilt BM25 index to {}: {}", path.display(), e);
            }
        }
        Ok(index)
    }

    /// Every stored record has a document and vice versa, by id
    async fn matches_store(index: &Bm25Index, store: &dyn GraphStore) -> Result<bool> {
        let entities = store.all_entities().await?;
        let facts = store.all_facts().await?;
        let episodes = store.all_episodes().await?;
        Ok(index.len(Corpus::Entities) == entities.len()
            && index.len(Corpus::Facts) == facts.len()
            && index.len(Corpus::Episodes) == episodes.len()
            && entities.iter().all(|e| index.contains(Corpus::Entities, &e.id.to_string()))
            && facts.iter().all(|f| index.contains(Corpus::Facts, &f.id.to_string()))
            && episodes.iter().all(|e| index.contains(Corpus::Episodes, &e.id.to_string())))
    }

    /// Write the index back to its side file, if one is configured
    ///
    /// A failed write only costs a rebuild on the next start.
    fn persist_index(&self) {
        let Some(path) = &self.config.index_path else {
            return;
        };
        if let Err(e) = self.index.read().save(path) {
            tracing::warn!("Failed to save BM25 index to {}: {}", path.display(), e);
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    /// Ingest one episode
    ///
    /// Stores the episode, resolves its entities and facts, and invalidates
    /// facts the new content supersedes. Duplicate content for the same owner
    /// within the dedup window returns the existing episode id without
    /// further work.
    ///
    /// # Errors
    /// Once the episode is stored, any later failure is returned as
    /// [`MemoryError::Ingestion`] carrying its id; work done so far stays.
    /// An embedding failure still stores the episode, without a vector.
    #[instrument(skip(self, request), fields(owner = %request.owner, episode = tracing::field::Empty))]
    pub async fn ingest(&self, request: IngestRequest) -> Result<EpisodeId> {
        if request.text.trim().is_empty() {
            return Err(MemoryError::validation("episode content is empty"));
        }
        if request.owner.trim().is_empty() {
            return Err(MemoryError::validation("owner is empty"));
        }

        let since = hours_before(Utc::now(), self.config.ingest.dedup_window_hours);
        if let Some(existing) = self
            .store
            .find_episode_by_content(&request.owner, &request.text, since)
            .await?
        {
            tracing::info!("Duplicate episode; returning {}", existing.id);
            return Ok(existing.id);
        }

        let (embedding, embed_error) = match self.embed_episode(&request.text).await {
            Ok(embedding) => (embedding, None),
            Err(e) => {
                tracing::warn!("Storing episode without embedding: {}", e);
                (None, Some(e))
            }
        };
        if let Some(embedding) = &embedding {
            if let Some(existing) = self.find_near_duplicate(&request.owner, embedding, since).await? {
                tracing::info!("Near-duplicate episode; returning {}", existing);
                return Ok(existing);
            }
        }

        let mut builder = Episode::builder()
            .owner(request.owner.clone())
            .content(request.text.clone())
            .source(request.source.clone())
            .tag(request.tag.clone())
            .metadata(request.metadata.clone());
        if let Some(session) = &request.session {
            builder = builder.session(session.clone());
        }
        if let Some(at) = request.valid_at {
            builder = builder.valid_at(at);
        }
        if let Some(embedding) = embedding {
            builder = builder.embedding(embedding);
        }
        let mut episode = builder
            .build()
            .map_err(|e| MemoryError::validation(e.to_string()))?;

        self.store.save_episode(&episode).await?;
        self.index.write().insert_episode(&episode);
        tracing::Span::current().record("episode", tracing::field::display(episode.id));

        let episode_id = episode.id;
        let outcome = match embed_error {
            Some(e) => Err(e),
            None => self.process(&mut episode).await,
        };
        self.persist_index();
        outcome.map_err(|e| MemoryError::Ingestion {
            episode_id,
            source: Box::new(e),
        })?;
        Ok(episode_id)
    }

    /// Resolution and invalidation for a stored episode
    async fn process(&self, episode: &mut Episode) -> Result<()> {
        let recent = self
            .store
            .recent_episodes(&episode.owner, self.config.resolver.context_episodes + 1)
            .await?
            .into_iter()
            .filter(|e| e.id != episode.id)
            .take(self.config.resolver.context_episodes)
            .map(|e| e.content)
            .collect();
        let context = ResolutionContext {
            episode_id: Some(episode.id),
            recent,
        };

        let resolution = self
            .resolver
            .resolve(&episode.content, &episode.owner, &context)
            .await?;

        episode.fact_ids = resolution.fact_ids();
        self.store.save_episode(episode).await?;
        {
            let mut index = self.index.write();
            index.insert_episode(episode);
            for entity in &resolution.entities {
                index.insert_entity(entity);
            }
            for fact in &resolution.facts {
                index.insert_fact(fact);
            }
        }

        let invalidated = self
            .invalidator
            .invalidate_conflicts(&resolution.facts, &episode.owner)
            .await?;
        if !invalidated.is_empty() {
            let mut index = self.index.write();
            for fact in &invalidated {
                index.insert_fact(fact);
            }
        }

        tracing::info!(
            "Ingested episode {}: {} entities, {} facts, {} invalidated",
            episode.id,
            resolution.entities.len(),
            resolution.facts.len(),
            invalidated.len()
        );
        Ok(())
    }

    async fn embed_episode(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let Some(embedder) = &self.embedder else {
            return Ok(None);
        };
        let embedding = with_retry(&self.config.retry, "embed_episode", || embedder.embed(text)).await?;
        Ok(Some(embedding))
    }

    /// Near-identical episode created since `since`
    async fn find_near_duplicate(
        &self,
        owner: &str,
        embedding: &[f32],
        since: DateTime<Utc>,
    ) -> Result<Option<EpisodeId>> {
        let query = VectorQuery::new(
            embedding.to_vec(),
            self.config.ingest.episode_dedup_threshold,
            5,
        )
        .owner(owner);
        Ok(self
            .store
            .search_episodes(&query)
            .await?
            .into_iter()
            .find(|(episode, _)| episode.created_at >= since)
            .map(|(episode, _)| episode.id))
    }

    /// Search the owner's memory
    ///
    /// # Arguments
    /// * `query` - Free text; empty runs a keyword/tag listing
    /// * `owner` - Whose memory to search
    /// * `config` - Strategy, limits and filters
    pub async fn search(&self, query: &str, owner: &str, config: &SearchConfig) -> Result<SearchResults> {
        self.engine.search(query, owner, config).await
    }

    /// Search with the configured defaults
    pub async fn search_default(&self, query: &str, owner: &str) -> Result<SearchResults> {
        self.engine.search(query, owner, &self.config.search).await
    }

    /// Prune the owner's graph and drop removed records from the keyword index
    #[instrument(skip(self, options))]
    pub async fn prune(&self, owner: &str, options: &PruneOptions) -> Result<PruneReport> {
        let report = self.pruner.prune(owner, options).await?;
        if !report.dry_run {
            let mut index = self.index.write();
            for id in &report.deleted_entities {
                index.remove(Corpus::Entities, &id.to_string());
            }
            for id in &report.deleted_facts {
                index.remove(Corpus::Facts, &id.to_string());
            }
            for fact in &report.updated_facts {
                index.insert_fact(fact);
            }
            for episode in &report.updated_episodes {
                index.insert_episode(episode);
            }
        }
        if !report.dry_run {
            self.persist_index();
        }
        Ok(report)
    }

    /// Retire a fact from the live graph at `at`
    ///
    /// # Errors
    /// `NotFound` for an unknown id; `Validation` if `at` precedes the
    /// fact's `valid_at` or `invalid_at`.
    #[instrument(skip(self))]
    pub async fn expire_fact(&self, id: FactId, at: DateTime<Utc>) -> Result<()> {
        let mut fact = self
            .store
            .get_fact(id)
            .await?
            .ok_or_else(|| MemoryError::not_found(id.to_string()))?;
        fact.temporal.expire_at(at)?;
        self.store.save_fact(&fact).await?;
        self.index.write().insert_fact(&fact);
        self.persist_index();
        Ok(())
    }

    /// Merge top-level keys into an episode's metadata
    #[instrument(skip(self, patch))]
    pub async fn patch_episode_metadata(&self, id: EpisodeId, patch: Map<String, Value>) -> Result<Episode> {
        let mut episode = self
            .store
            .get_episode(id)
            .await?
            .ok_or_else(|| MemoryError::not_found(id.to_string()))?;
        episode.patch_metadata(patch);
        self.store.save_episode(&episode).await?;
        // Tags live in metadata
        self.index.write().insert_episode(&episode);
        self.persist_index();
        Ok(episode)
    }

    /// Write the keyword index to the configured side file
    pub fn save_index(&self) -> Result<()> {
        let path = self
            .config
            .index_path
            .as_ref()
            .ok_or_else(|| MemoryError::config("no index_path configured"))?;
        self.index.read().save(path)
    }

    /// Rebuild the keyword index from the store
    #[instrument(skip(self))]
    pub async fn rebuild_index(&self) -> Result<()> {
        let rebuilt = Bm25Index::from_store(self.store.as_ref()).await?;
        *self.index.write() = rebuilt;
        self.persist_index();
        Ok(())
    }

    /// Number of indexed records in `corpus`
    pub fn indexed(&self, corpus: Corpus) -> usize {
        self.index.read().len(corpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryGraphStore;
    use crate::search::SearchStrategy;
    use crate::testing::{HashEmbedder, ScriptedExtractor};
    use chrono::Duration;
    use serde_json::json;

    async fn memory(config: MemoryConfig) -> (GraphMemory, Arc<InMemoryGraphStore>, Arc<ScriptedExtractor>) {
        let store = Arc::new(InMemoryGraphStore::new());
        let extractor = Arc::new(ScriptedExtractor::new());
        let memory = GraphMemory::new(
            store.clone(),
            extractor.clone(),
            Some(Arc::new(HashEmbedder::new(256))),
            MemoryConfig {
                retry: crate::retry::RetryPolicy::immediate(2),
                ..config
            },
        )
        .await
        .unwrap();
        (memory, store, extractor)
    }

    async fn memory_with(
        store: Arc<InMemoryGraphStore>,
        embedder: Arc<HashEmbedder>,
        config: MemoryConfig,
    ) -> GraphMemory {
        GraphMemory::new(
            store,
            Arc::new(ScriptedExtractor::new()),
            Some(embedder),
            MemoryConfig {
                retry: crate::retry::RetryPolicy::immediate(2),
                ..config
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_links_facts_to_episode() {
        let (memory, store, _) = memory(MemoryConfig::default()).await;
        let id = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();

        let episode = store.get_episode(id).await.unwrap().unwrap();
        assert_eq!(episode.fact_ids.len(), 1);
        assert!(episode.embedding.is_some());
        assert_eq!(memory.indexed(Corpus::Episodes), 1);
        assert_eq!(memory.indexed(Corpus::Entities), 2);
        assert_eq!(memory.indexed(Corpus::Facts), 1);
    }

    #[tokio::test]
    async fn test_identical_content_is_deduplicated() {
        let (memory, store, extractor) = memory(MemoryConfig::default()).await;
        let first = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();
        let second = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.episode_count(), 1);
        assert_eq!(extractor.calls("extract_entities"), 1);

        // Another owner gets its own episode
        let other = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u2"))
            .await
            .unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_extraction_failure_keeps_episode() {
        let (memory, store, extractor) = memory(MemoryConfig::default()).await;
        extractor.fail_next("extract_entities", 2);
        let err = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap_err();
        let MemoryError::Ingestion { episode_id, .. } = err else {
            panic!("expected ingestion error, got {err:?}");
        };
        assert!(store.get_episode(episode_id).await.unwrap().is_some());
        assert_eq!(store.entity_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected() {
        let (memory, store, _) = memory(MemoryConfig::default()).await;
        let err = memory.ingest(IngestRequest::new("   ", "u1")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
        assert_eq!(store.episode_count(), 0);
    }

    #[tokio::test]
    async fn test_expire_fact_enforces_order() {
        let (memory, store, _) = memory(MemoryConfig::default()).await;
        memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();
        let fact = store.facts_for_owner("u1").await.unwrap().remove(0);

        let err = memory
            .expire_fact(fact.id, fact.temporal.valid_at - Duration::days(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        memory.expire_fact(fact.id, Utc::now()).await.unwrap();
        let stored = store.get_fact(fact.id).await.unwrap().unwrap();
        assert!(stored.temporal.expired_at.is_some());

        let missing = memory.expire_fact(FactId::new(), Utc::now()).await.unwrap_err();
        assert!(matches!(missing, MemoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_patched_tags_are_searchable() {
        let (memory, _, _) = memory(MemoryConfig::default()).await;
        let id = memory
            .ingest(IngestRequest::new("Invoice numbers are wrong", "u1"))
            .await
            .unwrap();

        let config = SearchConfig::default().tags(&["billing"], crate::bm25::TagMatchMode::Any);
        assert!(memory.search("", "u1", &config).await.unwrap().episodes.is_empty());

        let patch = json!({"tags": ["Billing"]}).as_object().cloned().unwrap();
        memory.patch_episode_metadata(id, patch).await.unwrap();
        let results = memory.search("", "u1", &config).await.unwrap();
        assert_eq!(results.episodes.len(), 1);
        assert_eq!(results.episodes[0].item.id, id);
    }

    #[tokio::test]
    async fn test_save_index_requires_path() {
        let (memory, _, _) = memory(MemoryConfig::default()).await;
        assert!(matches!(memory.save_index(), Err(MemoryError::Config(_))));
    }

    #[tokio::test]
    async fn test_disabled_embeddings_skip_embedder() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(HashEmbedder::new(256));
        let memory = GraphMemory::new(
            store.clone(),
            Arc::new(ScriptedExtractor::new()),
            Some(embedder.clone()),
            MemoryConfig {
                embeddings_enabled: false,
                ..MemoryConfig::default()
            },
        )
        .await
        .unwrap();
        assert!(!memory.embeddings_enabled());

        memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();
        assert_eq!(embedder.calls(), 0);
        assert_eq!(store.fact_count(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_still_stores_episode() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(HashEmbedder::new(256));
        let memory = memory_with(store.clone(), embedder.clone(), MemoryConfig::default()).await;

        embedder.fail_next(10);
        let err = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap_err();
        let MemoryError::Ingestion { episode_id, .. } = err else {
            panic!("expected ingestion error, got {err:?}");
        };

        let stored = store.get_episode(episode_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Alice works at Google.");
        assert!(stored.embedding.is_none());
        assert_eq!(store.entity_count(), 0);
        assert_eq!(memory.indexed(Corpus::Episodes), 1);

        // Retried content is recognised without another embedding call
        let calls = embedder.calls();
        let again = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();
        assert_eq!(again, episode_id);
        assert_eq!(embedder.calls(), calls);
    }

    #[tokio::test]
    async fn test_identical_content_outside_window_is_new() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(HashEmbedder::new(256));
        let memory = memory_with(store.clone(), embedder.clone(), MemoryConfig::default()).await;

        let old = Episode::builder()
            .owner("u1")
            .content("Alice works at Google.")
            .embedding(embedder.vector("Alice works at Google."))
            .created_at(Utc::now() - Duration::hours(48))
            .build()
            .unwrap();
        store.save_episode(&old).await.unwrap();

        let id = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();
        assert_ne!(id, old.id);
        assert_eq!(store.episode_count(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_window_reaches_old_episodes() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(HashEmbedder::new(256));
        let mut config = MemoryConfig::default();
        config.ingest.dedup_window_hours = i64::MAX;
        let memory = memory_with(store.clone(), embedder, config).await;

        let old = Episode::builder()
            .owner("u1")
            .content("Alice works at Google.")
            .created_at(Utc::now() - Duration::days(3650))
            .build()
            .unwrap();
        store.save_episode(&old).await.unwrap();

        let id = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();
        assert_eq!(id, old.id);
    }

    #[tokio::test]
    async fn test_near_identical_content_is_deduplicated() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(HashEmbedder::new(256));
        let memory = memory_with(store.clone(), embedder, MemoryConfig::default()).await;

        let first = memory
            .ingest(IngestRequest::new("Alice works at Google.", "u1"))
            .await
            .unwrap();
        let second = memory
            .ingest(IngestRequest::new("ALICE works at Google!", "u1"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.episode_count(), 1);

        let third = memory
            .ingest(IngestRequest::new("Bob knows Carol.", "u1"))
            .await
            .unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_stale_index_file_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("bm25.idx");
        let stale_path = dir.path().join("stale.idx");
        let config = MemoryConfig {
            index_path: Some(index_path.clone()),
            ..MemoryConfig::default()
        };
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(HashEmbedder::new(256));

        {
            let memory = memory_with(store.clone(), embedder.clone(), config.clone()).await;
            memory
                .ingest(IngestRequest::new("Alice works at Google.", "u1"))
                .await
                .unwrap();
            std::fs::copy(&index_path, &stale_path).unwrap();
            memory
                .ingest(IngestRequest::new("Bob knows Carol.", "u1"))
                .await
                .unwrap();
        }

        // Written back after each ingest
        let reopened = memory_with(store.clone(), embedder.clone(), config.clone()).await;
        assert_eq!(reopened.indexed(Corpus::Episodes), 2);
        drop(reopened);

        std::fs::copy(&stale_path, &index_path).unwrap();
        let reopened = memory_with(store.clone(), embedder, config).await;
        assert_eq!(reopened.indexed(Corpus::Episodes), 2);

        let keyword = SearchConfig::default().strategy(SearchStrategy::Bm25);
        let results = reopened.search("Carol", "u1", &keyword).await.unwrap();
        assert_eq!(results.episodes.len(), 1);
        assert_eq!(results.episodes[0].item.content, "Bob knows Carol.");
    }
}
