//! Hybrid search engine
//!
//! Runs semantic, graph traversal and BM25 sub-searches over the three
//! collections and fuses them with Reciprocal Rank Fusion. Optional
//! temporal decay and update boost re-rank the fused output.

mod fusion;
mod rerank;

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::bm25::{Bm25Index, Bm25Query, Corpus, TagMatchMode};
use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::node::{normalize_name, Entity, EntityId, Episode, EpisodeSource, Fact};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{GraphStore, VectorQuery};

pub use fusion::{reciprocal_rank_fusion, DEFAULT_RRF_K};
pub use rerank::{TemporalDecay, UpdateBoost};

/// Retrieval strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Semantic,
    Traversal,
    Bm25,
    /// All three, fused by RRF
    #[default]
    Hybrid,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Traversal => "traversal",
            Self::Bm25 => "bm25",
            Self::Hybrid => "hybrid",
        }
    }
}

impl FromStr for SearchStrategy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Ok(Self::Semantic),
            "traversal" => Ok(Self::Traversal),
            "bm25" | "keyword" => Ok(Self::Bm25),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(MemoryError::config(format!(
                "unknown search strategy: {}",
                other
            ))),
        }
    }
}

/// Search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub strategy: SearchStrategy,
    /// Maximum results per collection (default: 10)
    pub limit: usize,
    /// Minimum cosine similarity for semantic hits (default: 0.5)
    pub semantic_threshold: f32,
    /// Traversal depth in layers (default: 2)
    pub max_depth: usize,
    /// Traversal seed entities (default: 5)
    pub seed_entities: usize,
    /// RRF constant (default: 60)
    pub rrf_k: f32,
    /// Fused results below this are dropped (default: 0.0)
    pub min_fused_score: f32,
    /// BM25 hits below this are dropped, except for tag-only queries (default: 0.0)
    pub bm25_min_score: f32,
    /// Episode tag filter
    pub tags: Vec<String>,
    pub tag_match: TagMatchMode,
    /// Episode source kinds; empty keeps all
    pub kinds: Vec<EpisodeSource>,
    /// Exclude facts superseded by newer information
    pub valid_only: bool,
    /// Point-in-time query: only facts valid at this instant
    pub as_of: Option<DateTime<Utc>>,
    pub decay: Option<TemporalDecay>,
    pub boost: Option<UpdateBoost>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::Hybrid,
            limit: 10,
            semantic_threshold: 0.5,
            max_depth: 2,
            seed_entities: 5,
            rrf_k: DEFAULT_RRF_K,
            min_fused_score: 0.0,
            bm25_min_score: 0.0,
            tags: Vec::new(),
            tag_match: TagMatchMode::Any,
            kinds: Vec::new(),
            valid_only: false,
            as_of: None,
            decay: None,
            boost: None,
        }
    }
}

impl SearchConfig {
    pub fn strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn tags(mut self, tags: &[&str], mode: TagMatchMode) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self.tag_match = mode;
        self
    }

    pub fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    /// Whether a fact passes the lifecycle filters
    fn admits_fact(&self, fact: &Fact, now: DateTime<Utc>) -> bool {
        let at = self.as_of.unwrap_or(now);
        if !fact.temporal.is_live_at(at) {
            return false;
        }
        if self.valid_only && fact.temporal.is_invalidated() {
            return false;
        }
        match self.as_of {
            Some(at) => fact.temporal.created_at <= at && fact.temporal.was_valid_at(at),
            None => true,
        }
    }

    fn admits_episode(&self, episode: &Episode) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&episode.source) {
            return false;
        }
        if self.tags.is_empty() {
            return true;
        }
        let wanted: Vec<String> = self.tags.iter().map(|t| normalize_name(t)).collect();
        let present = episode.tags();
        match self.tag_match {
            TagMatchMode::Any => wanted.iter().any(|t| present.contains(t)),
            TagMatchMode::All => wanted.iter().all(|t| present.contains(t)),
        }
    }
}

/// Record that can appear in search results
pub trait SearchItem: Clone {
    /// Stable key used for fusion and tie-breaks
    fn key(&self) -> String;
    fn created_at(&self) -> DateTime<Utc>;
    fn invalid_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl SearchItem for Entity {
    fn key(&self) -> String {
        self.id.to_string()
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl SearchItem for Fact {
    fn key(&self) -> String {
        self.id.to_string()
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.temporal.created_at
    }
    fn invalid_at(&self) -> Option<DateTime<Utc>> {
        self.temporal.invalid_at
    }
}

impl SearchItem for Episode {
    fn key(&self) -> String {
        self.id.to_string()
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A result with its score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scored<T> {
    pub item: T,
    pub score: f32,
}

impl<T> Scored<T> {
    pub fn new(item: T, score: f32) -> Self {
        Self { item, score }
    }
}

/// Ranked results per collection
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub entities: Vec<Scored<Entity>>,
    pub facts: Vec<Scored<Fact>>,
    pub episodes: Vec<Scored<Episode>>,
    /// Strategy that actually ran after fallbacks
    pub strategy: SearchStrategy,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.facts.is_empty() && self.episodes.is_empty()
    }

    fn cap(&mut self, limit: usize) {
        self.entities.truncate(limit);
        self.facts.truncate(limit);
        self.episodes.truncate(limit);
    }
}

/// Hybrid search over store and keyword index
pub struct SearchEngine {
    store: Arc<dyn GraphStore>,
    embedder: Option<Arc<dyn Embedder>>,
    index: Arc<RwLock<Bm25Index>>,
    retry: RetryPolicy,
}

impl SearchEngine {
    /// `embedder = None` runs keyword-only
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Option<Arc<dyn Embedder>>,
        index: Arc<RwLock<Bm25Index>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            retry,
        }
    }

    /// Strategy after the embeddings/empty-query fallbacks
    pub fn effective_strategy(&self, query: &str, requested: SearchStrategy) -> SearchStrategy {
        if query.trim().is_empty() {
            return SearchStrategy::Bm25;
        }
        match requested {
            SearchStrategy::Semantic | SearchStrategy::Hybrid if self.embedder.is_none() => {
                SearchStrategy::Bm25
            }
            other => other,
        }
    }

    #[instrument(skip(self, config), fields(strategy = tracing::field::Empty))]
    pub async fn search(
        &self,
        query: &str,
        owner: &str,
        config: &SearchConfig,
    ) -> Result<SearchResults> {
        let strategy = self.effective_strategy(query, config.strategy);
        tracing::Span::current().record("strategy", strategy.as_str());
        if strategy != config.strategy {
            tracing::debug!("Search downgraded from {:?} to {:?}", config.strategy, strategy);
        }

        let mut results = match strategy {
            SearchStrategy::Semantic => self.semantic(query, owner, config).await?,
            SearchStrategy::Traversal => self.traversal(query, owner, config).await?,
            SearchStrategy::Bm25 => self.bm25(query, owner, config).await?,
            SearchStrategy::Hybrid => self.hybrid(query, owner, config).await?,
        };
        results.strategy = strategy;

        let now = Utc::now();
        let (decay, boost) = (config.decay.as_ref(), config.boost.as_ref());
        rerank::apply(&mut results.entities, decay, boost, now);
        rerank::apply(&mut results.facts, decay, boost, now);
        rerank::apply(&mut results.episodes, decay, boost, now);

        tracing::debug!(
            "Search returned {} entities, {} facts, {} episodes",
            results.entities.len(),
            results.facts.len(),
            results.episodes.len()
        );
        Ok(results)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| MemoryError::config("embeddings are disabled"))?;
        with_retry(&self.retry, "embed", || embedder.embed(query)).await
    }

    /// Cosine searches over the three collections
    pub async fn semantic(
        &self,
        query: &str,
        owner: &str,
        config: &SearchConfig,
    ) -> Result<SearchResults> {
        let embedding = self.embed_query(query).await?;
        let now = Utc::now();
        let candidates = config.limit.saturating_mul(3).max(config.limit);
        let vector_query =
            VectorQuery::new(embedding, config.semantic_threshold, candidates).owner(owner);

        let mut episodes: Vec<Scored<Episode>> = self
            .store
            .search_episodes(&vector_query)
            .await?
            .into_iter()
            .filter(|(e, _)| config.admits_episode(e))
            .map(|(e, s)| Scored::new(e, s))
            .collect();
        episodes.truncate(config.limit);

        let mut entities: Vec<Scored<Entity>> = self
            .store
            .search_entities(&vector_query)
            .await?
            .into_iter()
            .map(|(e, s)| Scored::new(e, s))
            .collect();
        entities.truncate(config.limit);

        // Pull in entities mentioned by matched episodes at a discount
        let discounted = 0.9 * config.semantic_threshold;
        let mut present: HashSet<EntityId> = entities.iter().map(|s| s.item.id).collect();
        for episode in &episodes {
            for entity_id in self.store.mentions_for_episode(episode.item.id).await? {
                if !present.insert(entity_id) {
                    continue;
                }
                if let Some(entity) = self.store.get_entity(entity_id).await? {
                    if entity.owner == owner {
                        entities.push(Scored::new(entity, discounted));
                    }
                }
            }
        }
        rerank::sort_scored(&mut entities);

        let facts: Vec<Scored<Fact>> = self
            .store
            .search_facts(&vector_query)
            .await?
            .into_iter()
            .filter(|(f, _)| config.admits_fact(f, now))
            .map(|(f, s)| Scored::new(f, s))
            .collect();

        let mut results = SearchResults {
            entities,
            facts,
            episodes,
            strategy: SearchStrategy::Semantic,
        };
        results.cap(config.limit);
        Ok(results)
    }

    async fn seed_entities(
        &self,
        query: &str,
        owner: &str,
        config: &SearchConfig,
    ) -> Result<Vec<Entity>> {
        if self.embedder.is_some() {
            let embedding = self.embed_query(query).await?;
            let vector_query =
                VectorQuery::new(embedding, config.semantic_threshold, config.seed_entities)
                    .owner(owner);
            return Ok(self
                .store
                .search_entities(&vector_query)
                .await?
                .into_iter()
                .map(|(e, _)| e)
                .collect());
        }

        let hits = {
            let index = self.index.read();
            index.search(
                Corpus::Entities,
                &Bm25Query::new(query, config.seed_entities).owner(owner),
            )
        };
        let mut seeds = Vec::with_capacity(hits.len());
        for (id, _) in hits {
            if let Some(entity) = self.store.get_entity(id.parse()?).await? {
                seeds.push(entity);
            }
        }
        Ok(seeds)
    }

    /// Breadth-first expansion from seed entities.
    ///
    /// Seeds score 1.0; while expanding layer `d` (0-based) every newly
    /// traversed fact scores `1/(d+1)` and every newly reached entity
    /// `1/(d+2)`. Expansion stops once entities plus facts reach the limit.
    pub async fn traversal(
        &self,
        query: &str,
        owner: &str,
        config: &SearchConfig,
    ) -> Result<SearchResults> {
        let now = Utc::now();
        let seeds = self.seed_entities(query, owner, config).await?;

        let mut entities: Vec<Scored<Entity>> = Vec::new();
        let mut facts: Vec<Scored<Fact>> = Vec::new();
        let mut seen_entities: HashSet<EntityId> = HashSet::new();
        let mut seen_facts = HashSet::new();
        let mut frontier = Vec::new();

        for seed in seeds {
            if seen_entities.insert(seed.id) {
                frontier.push(seed.id);
                entities.push(Scored::new(seed, 1.0));
            }
        }

        let full = |entities: &Vec<Scored<Entity>>, facts: &Vec<Scored<Fact>>| {
            entities.len() + facts.len() >= config.limit
        };

        'layers: for depth in 0..config.max_depth {
            if frontier.is_empty() || full(&entities, &facts) {
                break;
            }
            let edge_score = 1.0 / (depth as f32 + 1.0);
            let node_score = 1.0 / (depth as f32 + 2.0);
            let mut next = Vec::new();

            for entity_id in std::mem::take(&mut frontier) {
                for fact in self.store.facts_for_entity(entity_id).await? {
                    if fact.owner != owner
                        || !config.admits_fact(&fact, now)
                        || !seen_facts.insert(fact.id)
                    {
                        continue;
                    }
                    let other = fact.other_end(entity_id);
                    facts.push(Scored::new(fact, edge_score));
                    if full(&entities, &facts) {
                        break 'layers;
                    }

                    let Some(other) = other else { continue };
                    if !seen_entities.insert(other) {
                        continue;
                    }
                    if let Some(entity) = self.store.get_entity(other).await? {
                        next.push(entity.id);
                        entities.push(Scored::new(entity, node_score));
                        if full(&entities, &facts) {
                            break 'layers;
                        }
                    }
                }
            }
            frontier = next;
        }

        Ok(SearchResults {
            entities,
            facts,
            episodes: Vec::new(),
            strategy: SearchStrategy::Traversal,
        })
    }

    /// Keyword search through the BM25 index
    pub async fn bm25(
        &self,
        query: &str,
        owner: &str,
        config: &SearchConfig,
    ) -> Result<SearchResults> {
        let now = Utc::now();
        let top_k = config.limit.saturating_mul(3).max(config.limit);
        let bm25_query = Bm25Query::new(query, top_k)
            .min_score(config.bm25_min_score)
            .tags(&config.tags, config.tag_match)
            .kinds(&config.kinds)
            .owner(owner);

        let (entity_hits, fact_hits, episode_hits) = {
            let index = self.index.read();
            let episodes: Vec<(Option<Episode>, String, f32)> = index
                .search(Corpus::Episodes, &bm25_query)
                .into_iter()
                .map(|(id, score)| (index.episode(&id), id, score))
                .collect();
            (
                index.search(Corpus::Entities, &bm25_query),
                index.search(Corpus::Facts, &bm25_query),
                episodes,
            )
        };

        let mut entities = Vec::new();
        for (id, score) in entity_hits {
            if let Some(entity) = self.store.get_entity(id.parse()?).await? {
                entities.push(Scored::new(entity, score));
            }
        }

        let mut facts = Vec::new();
        for (id, score) in fact_hits {
            if let Some(fact) = self.store.get_fact(id.parse()?).await? {
                if config.admits_fact(&fact, now) {
                    facts.push(Scored::new(fact, score));
                }
            }
        }

        let mut episodes = Vec::new();
        for (cached, id, score) in episode_hits {
            let episode = match cached {
                Some(episode) => Some(episode),
                None => self.store.get_episode(id.parse()?).await?,
            };
            if let Some(episode) = episode {
                episodes.push(Scored::new(episode, score));
            }
        }

        let mut results = SearchResults {
            entities,
            facts,
            episodes,
            strategy: SearchStrategy::Bm25,
        };
        results.cap(config.limit);
        Ok(results)
    }

    /// All three strategies fused per collection
    pub async fn hybrid(
        &self,
        query: &str,
        owner: &str,
        config: &SearchConfig,
    ) -> Result<SearchResults> {
        let semantic = self.semantic(query, owner, config).await?;
        let traversal = self.traversal(query, owner, config).await?;
        let keyword = self.bm25(query, owner, config).await?;
        let parts = [semantic, traversal, keyword];

        let mut results = SearchResults {
            entities: fuse(parts.iter().map(|r| r.entities.as_slice()), config),
            facts: fuse(parts.iter().map(|r| r.facts.as_slice()), config),
            episodes: fuse(parts.iter().map(|r| r.episodes.as_slice()), config),
            strategy: SearchStrategy::Hybrid,
        };
        results.cap(config.limit);
        Ok(results)
    }
}

/// RRF over ranked lists of one collection
fn fuse<'a, T: SearchItem + 'a>(
    lists: impl Iterator<Item = &'a [Scored<T>]>,
    config: &SearchConfig,
) -> Vec<Scored<T>> {
    let mut records: HashMap<String, T> = HashMap::new();
    let mut rankings = Vec::new();
    for list in lists {
        let mut ranking = Vec::with_capacity(list.len());
        for scored in list {
            let key = scored.item.key();
            records
                .entry(key.clone())
                .or_insert_with(|| scored.item.clone());
            ranking.push(key);
        }
        rankings.push(ranking);
    }

    reciprocal_rank_fusion(&rankings, config.rrf_k)
        .into_iter()
        .filter(|(_, score)| *score >= config.min_fused_score)
        .filter_map(|(key, score)| records.remove(&key).map(|item| Scored::new(item, score)))
        .collect()
}
