//! Graph store adapter
//!
//! [`GraphStore`] is the seam to the durable graph: record CRUD, the typed
//! graph queries the resolver and search engine need, and thresholded
//! cosine-similarity search. Two implementations ship with the crate:
//! [`InMemoryGraphStore`] and the RocksDB-backed [`RocksGraphStore`].

mod hnsw;
mod memory;
mod rocks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::node::{Entity, EntityId, Episode, EpisodeId, Fact, FactId, Mention};

pub use memory::InMemoryGraphStore;
pub use rocks::RocksGraphStore;

/// Cosine-similarity query over one record collection
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub embedding: Vec<f32>,
    /// Restrict to records of this owner
    pub owner: Option<String>,
    /// Minimum similarity, inclusive
    pub threshold: f32,
    pub limit: usize,
}

impl VectorQuery {
    pub fn new(embedding: Vec<f32>, threshold: f32, limit: usize) -> Self {
        Self {
            embedding,
            owner: None,
            threshold,
            limit,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    fn admits_owner(&self, owner: &str) -> bool {
        self.owner.as_deref().map_or(true, |o| o == owner)
    }
}

/// Durable store for episodes, entities, facts and mentions
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn save_episode(&self, episode: &Episode) -> Result<()>;
    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>>;
    /// Episodes of an owner, oldest first
    async fn episodes_for_owner(&self, owner: &str) -> Result<Vec<Episode>>;
    async fn all_episodes(&self) -> Result<Vec<Episode>>;

    async fn save_entity(&self, entity: &Entity) -> Result<()>;
    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>>;
    /// Entities of an owner, oldest first
    async fn entities_for_owner(&self, owner: &str) -> Result<Vec<Entity>>;
    async fn all_entities(&self) -> Result<Vec<Entity>>;
    async fn delete_entity(&self, id: EntityId) -> Result<bool>;

    async fn save_fact(&self, fact: &Fact) -> Result<()>;
    async fn get_fact(&self, id: FactId) -> Result<Option<Fact>>;
    async fn facts_for_owner(&self, owner: &str) -> Result<Vec<Fact>>;
    /// Facts with the entity on either end
    async fn facts_for_entity(&self, id: EntityId) -> Result<Vec<Fact>>;
    async fn all_facts(&self) -> Result<Vec<Fact>>;
    async fn delete_fact(&self, id: FactId) -> Result<bool>;

    async fn save_mention(&self, mention: &Mention) -> Result<()>;
    /// Entities mentioned by an episode
    async fn mentions_for_episode(&self, episode: EpisodeId) -> Result<Vec<EntityId>>;
    /// Remove every mention edge pointing at the entity
    async fn delete_mentions_for_entity(&self, entity: EntityId) -> Result<usize>;

    async fn search_episodes(&self, query: &VectorQuery) -> Result<Vec<(Episode, f32)>>;
    async fn search_entities(&self, query: &VectorQuery) -> Result<Vec<(Entity, f32)>>;
    async fn search_facts(&self, query: &VectorQuery) -> Result<Vec<(Fact, f32)>>;

    /// Most recent episodes of an owner, newest first
    async fn recent_episodes(&self, owner: &str, limit: usize) -> Result<Vec<Episode>> {
        let mut episodes = self.episodes_for_owner(owner).await?;
        episodes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        episodes.truncate(limit);
        Ok(episodes)
    }

    /// Byte-identical content of the owner created at or after `since`
    async fn find_episode_by_content(
        &self,
        owner: &str,
        content: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Episode>> {
        Ok(self
            .episodes_for_owner(owner)
            .await?
            .into_iter()
            .find(|e| e.created_at >= since && e.content == content))
    }

    /// Facts from `source` to `target`
    async fn facts_between(&self, source: EntityId, target: EntityId) -> Result<Vec<Fact>> {
        Ok(self
            .facts_for_entity(source)
            .await?
            .into_iter()
            .filter(|f| f.source == source && f.target == target)
            .collect())
    }
}

/// Exact ranking by cosine similarity, thresholded and capped
pub(crate) fn rank_by_similarity<T, E, K>(
    candidates: impl IntoIterator<Item = T>,
    query: &VectorQuery,
    embedding_of: E,
    key_of: K,
) -> Vec<(T, f32)>
where
    E: Fn(&T) -> Option<&Vec<f32>>,
    K: Fn(&T) -> uuid::Uuid,
{
    let mut scored: Vec<(T, f32)> = candidates
        .into_iter()
        .filter_map(|item| {
            let similarity = cosine_similarity(&query.embedding, embedding_of(&item)?);
            (similarity >= query.threshold).then_some((item, similarity))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| key_of(&a.0).cmp(&key_of(&b.0)))
    });
    scored.truncate(query.limit);
    scored
}
