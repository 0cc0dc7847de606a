//! In-process graph store
//!
//! DashMap-backed implementation of [`GraphStore`]. Nothing survives the
//! process; [`super::RocksGraphStore`] uses it as its read cache.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{rank_by_similarity, GraphStore, VectorQuery};
use crate::error::Result;
use crate::node::{Entity, EntityId, Episode, EpisodeId, Fact, FactId, Mention};

/// Graph store held entirely in memory
#[derive(Default)]
pub struct InMemoryGraphStore {
    episodes: DashMap<EpisodeId, Episode>,
    entities: DashMap<EntityId, Entity>,
    facts: DashMap<FactId, Fact>,
    mentions: DashMap<EpisodeId, Vec<Mention>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    pub(crate) fn insert_episode(&self, episode: Episode) {
        self.episodes.insert(episode.id, episode);
    }

    pub(crate) fn insert_entity(&self, entity: Entity) {
        self.entities.insert(entity.id, entity);
    }

    pub(crate) fn insert_fact(&self, fact: Fact) {
        self.facts.insert(fact.id, fact);
    }

    pub(crate) fn episode(&self, id: EpisodeId) -> Option<Episode> {
        self.episodes.get(&id).map(|e| e.clone())
    }

    pub(crate) fn entity(&self, id: EntityId) -> Option<Entity> {
        self.entities.get(&id).map(|e| e.clone())
    }

    pub(crate) fn fact(&self, id: FactId) -> Option<Fact> {
        self.facts.get(&id).map(|f| f.clone())
    }

    /// Returns false when the edge already existed
    pub(crate) fn insert_mention(&self, mention: Mention) -> bool {
        let mut edges = self.mentions.entry(mention.episode).or_default();
        if edges.iter().any(|m| m.entity == mention.entity) {
            return false;
        }
        edges.push(mention);
        true
    }

    /// Remove mention edges of an entity, returning the removed edges
    pub(crate) fn remove_mentions_for_entity(&self, entity: EntityId) -> Vec<Mention> {
        let mut removed = Vec::new();
        for mut edges in self.mentions.iter_mut() {
            edges.retain(|m| {
                if m.entity == entity {
                    removed.push(m.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.mentions.retain(|_, edges| !edges.is_empty());
        removed
    }

    fn sorted<T, K: Ord>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> K) -> Vec<T> {
        let mut out: Vec<T> = items.collect();
        out.sort_by_key(key);
        out
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn save_episode(&self, episode: &Episode) -> Result<()> {
        self.insert_episode(episode.clone());
        Ok(())
    }

    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>> {
        Ok(self.episode(id))
    }

    async fn episodes_for_owner(&self, owner: &str) -> Result<Vec<Episode>> {
        Ok(Self::sorted(
            self.episodes
                .iter()
                .filter(|e| e.owner == owner)
                .map(|e| e.value().clone()),
            |e| (e.created_at, e.id),
        ))
    }

    async fn all_episodes(&self) -> Result<Vec<Episode>> {
        Ok(Self::sorted(
            self.episodes.iter().map(|e| e.value().clone()),
            |e| (e.created_at, e.id),
        ))
    }

    async fn save_entity(&self, entity: &Entity) -> Result<()> {
        self.insert_entity(entity.clone());
        Ok(())
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        Ok(self.entity(id))
    }

    async fn entities_for_owner(&self, owner: &str) -> Result<Vec<Entity>> {
        Ok(Self::sorted(
            self.entities
                .iter()
                .filter(|e| e.owner == owner)
                .map(|e| e.value().clone()),
            |e| (e.created_at, e.id),
        ))
    }

    async fn all_entities(&self) -> Result<Vec<Entity>> {
        Ok(Self::sorted(
            self.entities.iter().map(|e| e.value().clone()),
            |e| (e.created_at, e.id),
        ))
    }

    async fn delete_entity(&self, id: EntityId) -> Result<bool> {
        Ok(self.entities.remove(&id).is_some())
    }

    async fn save_fact(&self, fact: &Fact) -> Result<()> {
        self.insert_fact(fact.clone());
        Ok(())
    }

    async fn get_fact(&self, id: FactId) -> Result<Option<Fact>> {
        Ok(self.fact(id))
    }

    async fn facts_for_owner(&self, owner: &str) -> Result<Vec<Fact>> {
        Ok(Self::sorted(
            self.facts
                .iter()
                .filter(|f| f.owner == owner)
                .map(|f| f.value().clone()),
            |f| (f.temporal.created_at, f.id),
        ))
    }

    async fn facts_for_entity(&self, id: EntityId) -> Result<Vec<Fact>> {
        Ok(Self::sorted(
            self.facts
                .iter()
                .filter(|f| f.touches(id))
                .map(|f| f.value().clone()),
            |f| (f.temporal.created_at, f.id),
        ))
    }

    async fn all_facts(&self) -> Result<Vec<Fact>> {
        Ok(Self::sorted(
            self.facts.iter().map(|f| f.value().clone()),
            |f| (f.temporal.created_at, f.id),
        ))
    }

    async fn delete_fact(&self, id: FactId) -> Result<bool> {
        Ok(self.facts.remove(&id).is_some())
    }

    async fn save_mention(&self, mention: &Mention) -> Result<()> {
        self.insert_mention(mention.clone());
        Ok(())
    }

    async fn mentions_for_episode(&self, episode: EpisodeId) -> Result<Vec<EntityId>> {
        Ok(self
            .mentions
            .get(&episode)
            .map(|edges| edges.iter().map(|m| m.entity).collect())
            .unwrap_or_default())
    }

    async fn delete_mentions_for_entity(&self, entity: EntityId) -> Result<usize> {
        Ok(self.remove_mentions_for_entity(entity).len())
    }

    async fn search_episodes(&self, query: &VectorQuery) -> Result<Vec<(Episode, f32)>> {
        let candidates = self
            .episodes
            .iter()
            .filter(|e| query.admits_owner(&e.owner))
            .map(|e| e.value().clone());
        Ok(rank_by_similarity(
            candidates,
            query,
            |e| e.embedding.as_ref(),
            |e| e.id.0,
        ))
    }

    async fn search_entities(&self, query: &VectorQuery) -> Result<Vec<(Entity, f32)>> {
        let candidates = self
            .entities
            .iter()
            .filter(|e| query.admits_owner(&e.owner))
            .map(|e| e.value().clone());
        Ok(rank_by_similarity(
            candidates,
            query,
            |e| e.name_embedding.as_ref(),
            |e| e.id.0,
        ))
    }

    async fn search_facts(&self, query: &VectorQuery) -> Result<Vec<(Fact, f32)>> {
        let candidates = self
            .facts
            .iter()
            .filter(|f| query.admits_owner(&f.owner))
            .map(|f| f.value().clone());
        Ok(rank_by_similarity(
            candidates,
            query,
            |f| f.embedding.as_ref(),
            |f| f.id.0,
        ))
    }
}
