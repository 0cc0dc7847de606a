//! BM25 keyword index
//!
//! Three corpora (entities, facts, episodes) with incrementally maintained
//! postings. The index is a derived cache: it can be saved to a side file
//! and rebuilt from the store at any time.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::node::{normalize_name, Entity, Episode, EpisodeSource, Fact};
use crate::storage::GraphStore;

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

/// Which collection a document belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Corpus {
    Entities,
    Facts,
    Episodes,
}

/// How a tag filter matches an episode's tag set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMatchMode {
    /// At least one requested tag is present
    #[default]
    Any,
    /// Every requested tag is present
    All,
}

impl TagMatchMode {
    fn matches(self, wanted: &[String], present: &[String]) -> bool {
        match self {
            Self::Any => wanted.iter().any(|t| present.contains(t)),
            Self::All => wanted.iter().all(|t| present.contains(t)),
        }
    }
}

/// Keyword query with pre-filters
#[derive(Debug, Clone, Default)]
pub struct Bm25Query {
    pub text: String,
    pub top_k: usize,
    /// Hits below this score are dropped (ignored for tag-only queries)
    pub min_score: f32,
    pub tags: Vec<String>,
    pub tag_match: TagMatchMode,
    /// Episode source kinds to keep; empty keeps all
    pub kinds: Vec<EpisodeSource>,
    pub owner: Option<String>,
}

impl Bm25Query {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            ..Default::default()
        }
    }

    pub fn min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn tags(mut self, tags: &[String], mode: TagMatchMode) -> Self {
        self.tags = tags.iter().map(|t| normalize_name(t)).collect();
        self.tag_match = mode;
        self
    }

    pub fn kinds(mut self, kinds: &[EpisodeSource]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Lowercase + whitespace split
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    owner: String,
    created_at: DateTime<Utc>,
    length: usize,
    term_freqs: HashMap<String, u32>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    kind: Option<EpisodeSource>,
    /// Episode object, embedding stripped
    #[serde(default)]
    episode: Option<Episode>,
}

impl Document {
    fn new(owner: &str, created_at: DateTime<Utc>, text: &str) -> Self {
        let tokens = tokenize(text);
        let mut term_freqs = HashMap::new();
        for token in &tokens {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }
        Self {
            owner: owner.to_string(),
            created_at,
            length: tokens.len(),
            term_freqs,
            tags: Vec::new(),
            kind: None,
            episode: None,
        }
    }

    fn admitted_by(&self, query: &Bm25Query) -> bool {
        if let Some(owner) = &query.owner {
            if &self.owner != owner {
                return false;
            }
        }
        if !query.kinds.is_empty() {
            match &self.kind {
                Some(kind) if query.kinds.contains(kind) => {}
                Some(_) => return false,
                None => {}
            }
        }
        if !query.tags.is_empty() && self.kind.is_some() {
            return query.tag_match.matches(&query.tags, &self.tags);
        }
        true
    }
}

/// One corpus: documents plus postings
#[derive(Debug, Default)]
struct CorpusIndex {
    docs: HashMap<String, Document>,
    /// term -> doc id -> term frequency
    postings: HashMap<String, HashMap<String, u32>>,
    total_length: usize,
}

impl CorpusIndex {
    fn insert(&mut self, id: String, doc: Document) {
        self.remove(&id);
        for (term, tf) in &doc.term_freqs {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.clone(), *tf);
        }
        self.total_length += doc.length;
        self.docs.insert(id, doc);
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(doc) = self.docs.remove(id) else {
            return false;
        };
        for term in doc.term_freqs.keys() {
            if let Some(list) = self.postings.get_mut(term) {
                list.remove(id);
                if list.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_length -= doc.length;
        true
    }

    fn avg_length(&self) -> f32 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_length as f32 / self.docs.len() as f32
        }
    }

    /// Calculate IDF
    fn idf(&self, doc_freq: usize) -> f32 {
        let n = self.docs.len() as f32;
        let df = doc_freq as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn search(&self, query: &Bm25Query, k1: f32, b: f32) -> Vec<(String, f32)> {
        let tokens = tokenize(&query.text);
        let mut hits: Vec<(&String, f32)> = if tokens.is_empty() {
            if query.tags.is_empty() {
                return Vec::new();
            }
            self.docs
                .iter()
                .filter(|(_, doc)| doc.kind.is_some() && doc.admitted_by(query))
                .map(|(id, _)| (id, 0.0))
                .collect()
        } else {
            let avg_length = self.avg_length().max(f32::EPSILON);
            let mut scores: HashMap<&String, f32> = HashMap::new();
            for token in &tokens {
                let Some(list) = self.postings.get(token) else {
                    continue;
                };
                let idf = self.idf(list.len());
                for (id, tf) in list {
                    let doc = &self.docs[id];
                    if !doc.admitted_by(query) {
                        continue;
                    }
                    let tf = *tf as f32;
                    let norm = 1.0 - b + b * doc.length as f32 / avg_length;
                    *scores.entry(id).or_insert(0.0) += idf * tf * (k1 + 1.0) / (tf + k1 * norm);
                }
            }
            scores
                .into_iter()
                .filter(|(_, score)| *score >= query.min_score)
                .collect()
        };

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.docs[b.0].created_at.cmp(&self.docs[a.0].created_at))
                .then_with(|| a.0.cmp(b.0))
        });
        hits.truncate(query.top_k);
        hits.into_iter().map(|(id, s)| (id.clone(), s)).collect()
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entities: HashMap<String, Document>,
    facts: HashMap<String, Document>,
    episodes: HashMap<String, Document>,
}

/// BM25 index over the three corpora
#[derive(Debug)]
pub struct Bm25Index {
    entities: CorpusIndex,
    facts: CorpusIndex,
    episodes: CorpusIndex,
    k1: f32,
    b: f32,
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new()
    }
}

impl Bm25Index {
    pub fn new() -> Self {
        Self {
            entities: CorpusIndex::default(),
            facts: CorpusIndex::default(),
            episodes: CorpusIndex::default(),
            k1: 1.2,
            b: 0.75,
        }
    }

    fn corpus(&self, corpus: Corpus) -> &CorpusIndex {
        match corpus {
            Corpus::Entities => &self.entities,
            Corpus::Facts => &self.facts,
            Corpus::Episodes => &self.episodes,
        }
    }

    fn corpus_mut(&mut self, corpus: Corpus) -> &mut CorpusIndex {
        match corpus {
            Corpus::Entities => &mut self.entities,
            Corpus::Facts => &mut self.facts,
            Corpus::Episodes => &mut self.episodes,
        }
    }

    /// Number of documents in a corpus
    pub fn len(&self, corpus: Corpus) -> usize {
        self.corpus(corpus).docs.len()
    }

    pub fn contains(&self, corpus: Corpus, id: &str) -> bool {
        self.corpus(corpus).docs.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.docs.is_empty() && self.facts.docs.is_empty() && self.episodes.docs.is_empty()
    }

    /// Index or re-index an entity (`name type summary`)
    pub fn insert_entity(&mut self, entity: &Entity) {
        let doc = Document::new(&entity.owner, entity.created_at, &entity.searchable_text());
        self.entities.insert(entity.id.to_string(), doc);
    }

    /// Index or re-index a fact (`relation fact`)
    pub fn insert_fact(&mut self, fact: &Fact) {
        let doc = Document::new(&fact.owner, fact.temporal.created_at, &fact.searchable_text());
        self.facts.insert(fact.id.to_string(), doc);
    }

    /// Index or re-index an episode with its tags and saved memories
    pub fn insert_episode(&mut self, episode: &Episode) {
        let mut doc = Document::new(&episode.owner, episode.created_at, &episode.searchable_text());
        doc.tags = episode.tags();
        doc.kind = Some(episode.source.clone());
        let mut record = episode.clone();
        record.embedding = None;
        doc.episode = Some(record);
        self.episodes.insert(episode.id.to_string(), doc);
    }

    pub fn remove(&mut self, corpus: Corpus, id: &str) -> bool {
        self.corpus_mut(corpus).remove(id)
    }

    /// Ranked (id, score): score desc, then recency desc, then id
    pub fn search(&self, corpus: Corpus, query: &Bm25Query) -> Vec<(String, f32)> {
        self.corpus(corpus).search(query, self.k1, self.b)
    }

    /// Indexed episode object (embedding stripped)
    pub fn episode(&self, id: &str) -> Option<Episode> {
        self.episodes.docs.get(id).and_then(|d| d.episode.clone())
    }

    /// Rebuild all corpora from the store
    pub async fn from_store(store: &dyn GraphStore) -> Result<Self> {
        let mut index = Self::new();
        for entity in store.all_entities().await? {
            index.insert_entity(&entity);
        }
        for fact in store.all_facts().await? {
            index.insert_fact(&fact);
        }
        for episode in store.all_episodes().await? {
            index.insert_episode(&episode);
        }
        tracing::info!(
            "Rebuilt BM25 index: {} entities, {} facts, {} episodes",
            index.entities.docs.len(),
            index.facts.docs.len(),
            index.episodes.docs.len()
        );
        Ok(index)
    }

    /// Write a MessagePack snapshot (temp file, then rename)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entities: self.entities.docs.clone(),
            facts: self.facts.docs.clone(),
            episodes: self.episodes.docs.clone(),
        };
        let bytes = rmp_serde::to_vec_named(&snapshot)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!("Saved BM25 index to {}", path.display());
        Ok(())
    }

    /// Load a snapshot written by [`Bm25Index::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let snapshot: Snapshot = rmp_serde::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MemoryError::store(format!(
                "BM25 snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let mut index = Self::new();
        for (corpus, docs) in [
            (Corpus::Entities, snapshot.entities),
            (Corpus::Facts, snapshot.facts),
            (Corpus::Episodes, snapshot.episodes),
        ] {
            let target = index.corpus_mut(corpus);
            for (id, doc) in docs {
                target.insert(id, doc);
            }
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EntityType;
    use chrono::Duration;
    use serde_json::json;

    fn episode(owner: &str, content: &str, tags: &[&str], age_days: i64) -> Episode {
        let mut metadata = serde_json::Map::new();
        metadata.insert("tags".into(), json!(tags));
        Episode::builder()
            .owner(owner)
            .content(content)
            .metadata(metadata)
            .created_at(Utc::now() - Duration::days(age_days))
            .build()
            .unwrap()
    }

    #[test]
    fn test_bm25_tokenize() {
        assert_eq!(tokenize("Hello  World\tagain"), vec!["hello", "world", "again"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_ranking_prefers_rarer_terms() {
        let mut index = Bm25Index::new();
        let a = episode("u1", "invoice overdue for billing account", &[], 1);
        let b = episode("u1", "account settings changed", &[], 1);
        let c = episode("u1", "account login", &[], 1);
        for ep in [&a, &b, &c] {
            index.insert_episode(ep);
        }

        let hits = index.search(Corpus::Episodes, &Bm25Query::new("invoice account", 10));
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, a.id.to_string());
    }

    #[test]
    fn test_incremental_matches_full_rebuild() {
        let docs: Vec<Episode> = (0..6)
            .map(|i| episode("u1", &format!("alpha beta {}", "gamma ".repeat(i)), &[], 1))
            .collect();

        let mut incremental = Bm25Index::new();
        for doc in &docs {
            incremental.insert_episode(doc);
        }
        // replace and remove keep statistics consistent
        incremental.insert_episode(&docs[0]);
        let extra = episode("u1", "delta", &[], 1);
        incremental.insert_episode(&extra);
        incremental.remove(Corpus::Episodes, &extra.id.to_string());

        let mut rebuilt = Bm25Index::new();
        for doc in &docs {
            rebuilt.insert_episode(doc);
        }

        let query = Bm25Query::new("gamma", 10);
        assert_eq!(
            incremental.search(Corpus::Episodes, &query),
            rebuilt.search(Corpus::Episodes, &query)
        );
    }

    #[test]
    fn test_tag_only_query_orders_by_recency() {
        let mut index = Bm25Index::new();
        let old = episode("u1", "refund issued", &["billing"], 5);
        let new = episode("u1", "card declined", &["Billing", "payments"], 1);
        let other = episode("u1", "password reset", &["auth"], 0);
        for ep in [&old, &new, &other] {
            index.insert_episode(ep);
        }

        let query = Bm25Query::new("", 10).tags(&["billing".to_string()], TagMatchMode::Any);
        let hits = index.search(Corpus::Episodes, &query);
        let ids: Vec<String> = hits.iter().map(|h| h.0.clone()).collect();
        assert_eq!(ids, vec![new.id.to_string(), old.id.to_string()]);
        assert!(hits.iter().all(|h| h.1 == 0.0));

        let all = Bm25Query::new("", 10).tags(
            &["billing".to_string(), "payments".to_string()],
            TagMatchMode::All,
        );
        assert_eq!(index.search(Corpus::Episodes, &all).len(), 1);
    }

    #[test]
    fn test_owner_and_kind_filters() {
        let mut index = Bm25Index::new();
        index.insert_episode(&episode("u1", "shared words", &[], 1));
        index.insert_episode(&episode("u2", "shared words", &[], 1));
        let alice = Entity::new("u1", "Alice", EntityType::Person);
        index.insert_entity(&alice);

        let query = Bm25Query::new("shared", 10).owner("u2");
        assert_eq!(index.search(Corpus::Episodes, &query).len(), 1);

        let query = Bm25Query::new("shared", 10).kinds(&[EpisodeSource::Message]);
        assert!(index.search(Corpus::Episodes, &query).is_empty());

        let hits = index.search(Corpus::Entities, &Bm25Query::new("alice", 5));
        assert_eq!(hits[0].0, alice.id.to_string());
    }

    #[test]
    fn test_snapshot_round_trip_and_version_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm25.idx");

        let mut index = Bm25Index::new();
        let ep = episode("u1", "quarterly billing report", &["billing"], 2);
        index.insert_episode(&ep);
        index.save(&path).unwrap();

        let loaded = Bm25Index::load(&path).unwrap();
        let query = Bm25Query::new("billing", 5);
        assert_eq!(
            loaded.search(Corpus::Episodes, &query),
            index.search(Corpus::Episodes, &query)
        );
        assert_eq!(loaded.episode(&ep.id.to_string()).map(|e| e.content), Some(ep.content));

        std::fs::write(&path, b"garbage").unwrap();
        assert!(Bm25Index::load(&path).is_err());
    }
}
