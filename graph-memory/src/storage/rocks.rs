//! RocksDB storage with HNSW indexing
//!
//! Persistent graph store using RocksDB with LZ4 compression. Records are
//! MessagePack-encoded under `ep:`, `ent:`, `fact:` and `men:` prefixes;
//! embeddings live apart under `vec:` in bincode. All records are loaded
//! into an [`InMemoryGraphStore`] cache at open and written through on
//! every mutation. Similarity search asks the HNSW index for candidates
//! and falls back to an exact scan when filtering leaves too few.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::hnsw::VectorIndex;
use super::memory::InMemoryGraphStore;
use super::{GraphStore, VectorQuery};
use crate::error::Result;
use crate::node::{Entity, EntityId, Episode, EpisodeId, Fact, FactId, Mention};

const EPISODE_PREFIX: &str = "ep:";
const ENTITY_PREFIX: &str = "ent:";
const FACT_PREFIX: &str = "fact:";
const MENTION_PREFIX: &str = "men:";
const VECTOR_PREFIX: &str = "vec:";

/// Record kinds that carry an embedding
#[derive(Clone, Copy)]
enum VectorKind {
    Episode,
    Entity,
    Fact,
}

impl VectorKind {
    fn key(self, id: impl std::fmt::Display) -> String {
        let kind = match self {
            Self::Episode => "ep",
            Self::Entity => "ent",
            Self::Fact => "fact",
        };
        format!("{}{}:{}", VECTOR_PREFIX, kind, id)
    }
}

/// RocksDB-based graph store with HNSW indexing
pub struct RocksGraphStore {
    db: Arc<DB>,
    cache: InMemoryGraphStore,
    episode_vectors: VectorIndex,
    entity_vectors: VectorIndex,
    fact_vectors: VectorIndex,
}

impl RocksGraphStore {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        // Run migration if needed before opening database
        crate::migration::migrate_if_needed(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        crate::migration::stamp_version(&db)?;

        tracing::info!("RocksGraphStore opened at: {}", path.display());

        let store = Self {
            db: Arc::new(db),
            cache: InMemoryGraphStore::new(),
            episode_vectors: VectorIndex::new(),
            entity_vectors: VectorIndex::new(),
            fact_vectors: VectorIndex::new(),
        };

        store.load_cache()?;
        Ok(store)
    }

    /// Load existing records into the cache on startup
    fn load_cache(&self) -> Result<()> {
        let mut loaded = 0usize;
        let mut skipped = 0usize;

        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);

            let outcome = if key_str.starts_with(EPISODE_PREFIX) {
                decode::<Episode>(&value).map(|mut episode| {
                    episode.embedding = self.load_vector(VectorKind::Episode, episode.id);
                    if let Some(vector) = &episode.embedding {
                        self.episode_vectors
                            .upsert(episode.id.to_string(), vector.clone());
                    }
                    self.cache.insert_episode(episode);
                })
            } else if key_str.starts_with(ENTITY_PREFIX) {
                decode::<Entity>(&value).map(|mut entity| {
                    entity.name_embedding = self.load_vector(VectorKind::Entity, entity.id);
                    if let Some(vector) = &entity.name_embedding {
                        self.entity_vectors
                            .upsert(entity.id.to_string(), vector.clone());
                    }
                    self.cache.insert_entity(entity);
                })
            } else if key_str.starts_with(FACT_PREFIX) {
                decode::<Fact>(&value).map(|mut fact| {
                    fact.embedding = self.load_vector(VectorKind::Fact, fact.id);
                    if let Some(vector) = &fact.embedding {
                        self.fact_vectors.upsert(fact.id.to_string(), vector.clone());
                    }
                    self.cache.insert_fact(fact);
                })
            } else if key_str.starts_with(MENTION_PREFIX) {
                decode::<Mention>(&value).map(|mention| {
                    self.cache.insert_mention(mention);
                })
            } else {
                continue;
            };

            match outcome {
                Ok(()) => loaded += 1,
                Err(e) => {
                    // Gracefully skip records that no longer decode
                    tracing::warn!("Failed to decode record {}: {}. Skipping.", key_str, e);
                    skipped += 1;
                }
            }
        }

        if loaded > 0 {
            tracing::info!("Loaded {} records from disk", loaded);
        }
        if skipped > 0 {
            tracing::warn!("Skipped {} records due to decode errors", skipped);
        }
        Ok(())
    }

    fn load_vector(&self, kind: VectorKind, id: impl std::fmt::Display) -> Option<Vec<f32>> {
        match self.db.get(kind.key(id).as_bytes()) {
            Ok(Some(bytes)) => bincode::deserialize::<Vec<f32>>(&bytes).ok(),
            _ => None,
        }
    }

    /// Write a record and its vector in one batch
    fn write_record<T: Serialize>(
        &self,
        key: String,
        record: &T,
        vector: Option<(VectorKind, String, &Vec<f32>)>,
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(key.as_bytes(), rmp_serde::to_vec_named(record)?);
        if let Some((kind, id, vector)) = vector {
            batch.put(kind.key(id).as_bytes(), bincode::serialize(vector)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn delete_record(&self, key: String, vector_key: Option<String>) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete(key.as_bytes());
        if let Some(vector_key) = vector_key {
            batch.delete(vector_key.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Resolve HNSW candidates against the cache, falling back to the exact
    /// scan when filters leave fewer than `limit` hits
    fn approximate<T>(
        &self,
        index: &VectorIndex,
        query: &VectorQuery,
        lookup: impl Fn(&str) -> Option<T>,
        owner_of: impl Fn(&T) -> &str,
    ) -> Option<Vec<(T, f32)>> {
        let candidates = index.candidates(&query.embedding);
        let examined = candidates.len();
        let mut hits = Vec::new();
        for (id, similarity) in candidates {
            if similarity < query.threshold {
                continue;
            }
            let Some(record) = lookup(&id) else {
                continue;
            };
            if query.owner.as_deref().map_or(true, |o| o == owner_of(&record)) {
                hits.push((record, similarity));
            }
            if hits.len() >= query.limit {
                return Some(hits);
            }
        }
        // Exhaustive when the graph yielded every point
        (examined >= index.len()).then_some(hits)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn strip<T: Clone>(record: &T, clear: impl FnOnce(&mut T)) -> T {
    let mut stripped = record.clone();
    clear(&mut stripped);
    stripped
}

#[async_trait]
impl GraphStore for RocksGraphStore {
    async fn save_episode(&self, episode: &Episode) -> Result<()> {
        let record = strip(episode, |e| e.embedding = None);
        let vector = episode
            .embedding
            .as_ref()
            .map(|v| (VectorKind::Episode, episode.id.to_string(), v));
        self.write_record(format!("{}{}", EPISODE_PREFIX, episode.id), &record, vector)?;
        if let Some(vector) = &episode.embedding {
            self.episode_vectors
                .upsert(episode.id.to_string(), vector.clone());
        }
        self.cache.insert_episode(episode.clone());
        Ok(())
    }

    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>> {
        self.cache.get_episode(id).await
    }

    async fn episodes_for_owner(&self, owner: &str) -> Result<Vec<Episode>> {
        self.cache.episodes_for_owner(owner).await
    }

    async fn all_episodes(&self) -> Result<Vec<Episode>> {
        self.cache.all_episodes().await
    }

    async fn save_entity(&self, entity: &Entity) -> Result<()> {
        let record = strip(entity, |e| e.name_embedding = None);
        let vector = entity
            .name_embedding
            .as_ref()
            .map(|v| (VectorKind::Entity, entity.id.to_string(), v));
        self.write_record(format!("{}{}", ENTITY_PREFIX, entity.id), &record, vector)?;
        if let Some(vector) = &entity.name_embedding {
            self.entity_vectors
                .upsert(entity.id.to_string(), vector.clone());
        }
        self.cache.insert_entity(entity.clone());
        Ok(())
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        self.cache.get_entity(id).await
    }

    async fn entities_for_owner(&self, owner: &str) -> Result<Vec<Entity>> {
        self.cache.entities_for_owner(owner).await
    }

    async fn all_entities(&self) -> Result<Vec<Entity>> {
        self.cache.all_entities().await
    }

    async fn delete_entity(&self, id: EntityId) -> Result<bool> {
        self.delete_record(
            format!("{}{}", ENTITY_PREFIX, id),
            Some(VectorKind::Entity.key(id)),
        )?;
        self.entity_vectors.remove(&id.to_string());
        self.cache.delete_entity(id).await
    }

    async fn save_fact(&self, fact: &Fact) -> Result<()> {
        let record = strip(fact, |f| f.embedding = None);
        let vector = fact
            .embedding
            .as_ref()
            .map(|v| (VectorKind::Fact, fact.id.to_string(), v));
        self.write_record(format!("{}{}", FACT_PREFIX, fact.id), &record, vector)?;
        if let Some(vector) = &fact.embedding {
            self.fact_vectors.upsert(fact.id.to_string(), vector.clone());
        }
        self.cache.insert_fact(fact.clone());
        Ok(())
    }

    async fn get_fact(&self, id: FactId) -> Result<Option<Fact>> {
        self.cache.get_fact(id).await
    }

    async fn facts_for_owner(&self, owner: &str) -> Result<Vec<Fact>> {
        self.cache.facts_for_owner(owner).await
    }

    async fn facts_for_entity(&self, id: EntityId) -> Result<Vec<Fact>> {
        self.cache.facts_for_entity(id).await
    }

    async fn all_facts(&self) -> Result<Vec<Fact>> {
        self.cache.all_facts().await
    }

    async fn delete_fact(&self, id: FactId) -> Result<bool> {
        self.delete_record(
            format!("{}{}", FACT_PREFIX, id),
            Some(VectorKind::Fact.key(id)),
        )?;
        self.fact_vectors.remove(&id.to_string());
        self.cache.delete_fact(id).await
    }

    async fn save_mention(&self, mention: &Mention) -> Result<()> {
        let key = format!("{}{}:{}", MENTION_PREFIX, mention.episode, mention.entity);
        self.write_record(key, mention, None)?;
        self.cache.insert_mention(mention.clone());
        Ok(())
    }

    async fn mentions_for_episode(&self, episode: EpisodeId) -> Result<Vec<EntityId>> {
        self.cache.mentions_for_episode(episode).await
    }

    async fn delete_mentions_for_entity(&self, entity: EntityId) -> Result<usize> {
        let removed = self.cache.remove_mentions_for_entity(entity);
        let mut batch = WriteBatch::default();
        for mention in &removed {
            let key = format!("{}{}:{}", MENTION_PREFIX, mention.episode, mention.entity);
            batch.delete(key.as_bytes());
        }
        self.db.write(batch)?;
        Ok(removed.len())
    }

    async fn search_episodes(&self, query: &VectorQuery) -> Result<Vec<(Episode, f32)>> {
        let approximate = self.approximate(
            &self.episode_vectors,
            query,
            |id| id.parse().ok().and_then(|id| self.cache.episode(id)),
            |e: &Episode| e.owner.as_str(),
        );
        match approximate {
            Some(hits) => Ok(hits),
            None => self.cache.search_episodes(query).await,
        }
    }

    async fn search_entities(&self, query: &VectorQuery) -> Result<Vec<(Entity, f32)>> {
        let approximate = self.approximate(
            &self.entity_vectors,
            query,
            |id| id.parse().ok().and_then(|id| self.cache.entity(id)),
            |e: &Entity| e.owner.as_str(),
        );
        match approximate {
            Some(hits) => Ok(hits),
            None => self.cache.search_entities(query).await,
        }
    }

    async fn search_facts(&self, query: &VectorQuery) -> Result<Vec<(Fact, f32)>> {
        let approximate = self.approximate(
            &self.fact_vectors,
            query,
            |id| id.parse().ok().and_then(|id| self.cache.fact(id)),
            |f: &Fact| f.owner.as_str(),
        );
        match approximate {
            Some(hits) => Ok(hits),
            None => self.cache.search_facts(query).await,
        }
    }
}
