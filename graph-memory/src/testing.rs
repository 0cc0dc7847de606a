//! Deterministic collaborators
//!
//! [`HashEmbedder`] and [`ScriptedExtractor`] stand in for the embedding and
//! LLM clients so the full pipeline runs offline: in unit tests, the
//! integration scenarios and the benchmarks.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::extraction::{Contradiction, ExtractedEntity, ExtractedRelationship, Extractor};

/// Bag-of-words embedder over lowercase tokens
pub struct HashEmbedder {
    dimension: usize,
    calls: AtomicUsize,
    failures: AtomicU32,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            calls: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
        }
    }

    /// Number of texts embedded so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` calls with a collaborator error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// The vector for `text`, L2-normalized.
    ///
    /// Every token contributes a dense ±1 vector seeded by its hash, so
    /// distinct words are nearly orthogonal.
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in words(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let mut state = hasher.finish() | 1;
            for slot in vector.iter_mut() {
                // xorshift64
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                *slot += if state & 1 == 0 { 1.0 } else { -1.0 };
            }
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.take_failure() {
            return Err(MemoryError::collaborator("embed", "injected failure"));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.take_failure() {
            return Err(MemoryError::collaborator("embed_batch", "injected failure"));
        }
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Lowercase alphanumeric tokens
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Capitalized words that never name an entity
const STOPWORDS: &[&str] = &[
    "A", "An", "And", "But", "He", "I", "In", "It", "My", "On", "She", "The", "They", "We",
];

/// Rule-based extractor.
///
/// Entities are capitalized words. A relationship is the phrase between two
/// entities in one sentence, mapped through the relation table (`works at`
/// and `moved to` both mean `WORKS_AT` by default). Two facts contradict
/// when subject and relation agree but the object differs.
/// `structured_output` replays queued payloads per schema title.
pub struct ScriptedExtractor {
    types: HashMap<String, String>,
    relations: Vec<(String, String)>,
    structured: Mutex<HashMap<String, VecDeque<Value>>>,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl Default for ScriptedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
            relations: vec![
                ("works at".to_string(), "WORKS_AT".to_string()),
                ("moved to".to_string(), "WORKS_AT".to_string()),
                ("joined".to_string(), "WORKS_AT".to_string()),
                ("lives in".to_string(), "LIVES_IN".to_string()),
                ("knows".to_string(), "KNOWS".to_string()),
            ],
            structured: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Report `name` with the given entity type
    pub fn entity_type(mut self, name: &str, entity_type: &str) -> Self {
        self.types.insert(name.to_string(), entity_type.to_string());
        self
    }

    /// Map a connecting phrase to a relation name
    pub fn relation(mut self, phrase: &str, relation: &str) -> Self {
        self.relations
            .push((phrase.to_lowercase(), relation.to_string()));
        self
    }

    /// Queue a `structured_output` payload for schemas titled `title`
    pub fn respond(&self, title: &str, payload: Value) {
        self.structured
            .lock()
            .entry(title.to_string())
            .or_default()
            .push_back(payload);
    }

    /// Fail the next `n` calls of `operation` with a collaborator error
    pub fn fail_next(&self, operation: &str, n: u32) {
        self.failures.lock().insert(operation.to_string(), n);
    }

    /// Calls made to `operation` so far
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    fn enter(&self, operation: &str) -> Result<()> {
        *self.calls.lock().entry(operation.to_string()).or_default() += 1;
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MemoryError::collaborator(operation, "injected failure"));
            }
        }
        Ok(())
    }

    fn relation_for(&self, phrase: &str) -> String {
        let phrase = phrase.trim().to_lowercase();
        self.relations
            .iter()
            .find(|(p, _)| *p == phrase)
            .map(|(_, r)| r.clone())
            .unwrap_or(phrase)
    }

    /// Split a fact sentence into (subject, relation, object)
    fn parse_fact(&self, text: &str) -> Option<(String, String, String)> {
        let lower = text.to_lowercase();
        self.relations.iter().find_map(|(phrase, relation)| {
            let at = lower.find(&format!(" {} ", phrase))?;
            let subject = lower[..at].trim().to_string();
            let object = lower[at + phrase.len() + 2..]
                .trim()
                .trim_end_matches(|c: char| !c.is_alphanumeric())
                .to_string();
            Some((subject, relation.clone(), object))
        })
    }
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c| matches!(c, '.' | '!' | '?' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn is_entity_word(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase) && !STOPWORDS.contains(&word)
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract_entities(
        &self,
        text: &str,
        _owner: &str,
        _context: &[String],
    ) -> Result<Vec<ExtractedEntity>> {
        self.enter("extract_entities")?;
        let mut seen = Vec::new();
        let mut entities = Vec::new();
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if is_entity_word(word) && !seen.contains(&word) {
                seen.push(word);
                let entity_type = self.types.get(word).cloned().unwrap_or_default();
                entities.push(ExtractedEntity::new(word, entity_type));
            }
        }
        Ok(entities)
    }

    async fn extract_relationships(
        &self,
        text: &str,
        names: &[String],
        _owner: &str,
        _context: &[String],
    ) -> Result<Vec<ExtractedRelationship>> {
        self.enter("extract_relationships")?;
        let mut relationships = Vec::new();
        for sentence in sentences(text) {
            let mut positions: Vec<(usize, &String)> = names
                .iter()
                .filter_map(|name| sentence.find(name.as_str()).map(|at| (at, name)))
                .collect();
            positions.sort();
            for pair in positions.windows(2) {
                let (start, source) = pair[0];
                let (end, target) = pair[1];
                let phrase = &sentence[start + source.len()..end];
                if phrase.trim().is_empty() {
                    continue;
                }
                relationships.push(ExtractedRelationship::new(
                    source.clone(),
                    self.relation_for(phrase),
                    target.clone(),
                    sentence,
                ));
            }
        }
        Ok(relationships)
    }

    async fn detect_contradictions(
        &self,
        new_facts: &[String],
        existing_facts: &[String],
    ) -> Result<Vec<Contradiction>> {
        self.enter("detect_contradictions")?;
        let mut found = Vec::new();
        for (new_index, new_fact) in new_facts.iter().enumerate() {
            let Some((subject, relation, object)) = self.parse_fact(new_fact) else {
                continue;
            };
            for (existing_index, existing) in existing_facts.iter().enumerate() {
                if let Some((s, r, o)) = self.parse_fact(existing) {
                    if s == subject && r == relation && o != object {
                        found.push(Contradiction {
                            new_index,
                            existing_index,
                            reason: format!("{} {} changed from {} to {}", s, r, o, object),
                        });
                    }
                }
            }
        }
        Ok(found)
    }

    async fn structured_output(&self, prompt: &str, schema: &Value) -> Result<Value> {
        self.enter("structured_output")?;
        let title = schema
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(payload) = self
            .structured
            .lock()
            .get_mut(&title)
            .and_then(VecDeque::pop_front)
        {
            return Ok(payload);
        }

        if title == "entity_summary" {
            let lines: Vec<&str> = prompt
                .lines()
                .filter_map(|l| l.trim().strip_prefix("- "))
                .collect();
            return Ok(json!({ "summary": lines.join("; ") }));
        }
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.vector("Alice (person)");
        let b = embedder.vector("alice  (PERSON)");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &embedder.vector("Google (organization)")) < 0.7);
    }

    #[tokio::test]
    async fn test_extracts_relationship_between_names() {
        let extractor = ScriptedExtractor::new();
        let names = vec!["Alice".to_string(), "Google".to_string()];
        let rels = extractor
            .extract_relationships("Alice works at Google.", &names, "u1", &[])
            .await
            .unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].relation, "WORKS_AT");
        assert_eq!(rels[0].destination, "Google");
        assert_eq!(rels[0].fact, "Alice works at Google");
    }

    #[tokio::test]
    async fn test_contradiction_on_changed_object() {
        let extractor = ScriptedExtractor::new();
        let found = extractor
            .detect_contradictions(
                &["Alice moved to Meta".to_string()],
                &["Alice works at Google".to_string(), "Alice knows Bob".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].existing_index, 0);
    }

    #[tokio::test]
    async fn test_failure_injection_counts_down() {
        let extractor = ScriptedExtractor::new();
        extractor.fail_next("extract_entities", 1);
        assert!(extractor.extract_entities("Alice", "u1", &[]).await.is_err());
        assert!(extractor.extract_entities("Alice", "u1", &[]).await.is_ok());
        assert_eq!(extractor.calls("extract_entities"), 2);
    }
}
