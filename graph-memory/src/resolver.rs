//! Entity and relationship resolution
//!
//! Turns extracted candidates into stored entities and facts: candidates
//! are embedded, matched against the owner's existing records by cosine
//! similarity and either merged (mention count +1) or created.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::cascade::{CascadeConfig, CascadeExtractor, CandidateGraph};
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::Result;
use crate::extraction::{
    parse_structured, EntitySummary, ExtractedEntity, ExtractedRelationship, Extractor,
};
use crate::node::{
    normalize_name, Entity, EntityId, EntityType, EpisodeId, Fact, FactId, Mention, Relation,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{GraphStore, VectorQuery};

/// How candidates are extracted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStrategy {
    /// One entity call, one relationship call
    #[default]
    Standard,
    /// Multi-round candidate graph
    Cascade,
}

/// Resolver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum cosine similarity to merge entities (default: 0.7)
    pub entity_threshold: f32,
    /// Minimum cosine similarity to merge facts (default: 0.8)
    pub fact_threshold: f32,
    /// Existing entities considered per candidate (default: 5)
    pub entity_candidates: usize,
    /// Recent episodes passed as extraction context (default: 4)
    pub context_episodes: usize,
    /// Relationships fed into summary regeneration (default: 5)
    pub summary_relationships: usize,
    pub strategy: ExtractionStrategy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            entity_threshold: 0.7,
            fact_threshold: 0.8,
            entity_candidates: 5,
            context_episodes: 4,
            summary_relationships: 5,
            strategy: ExtractionStrategy::Standard,
        }
    }
}

/// Inputs that accompany the text being resolved
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Episode the text came from; enables mentions and fact provenance
    pub episode_id: Option<EpisodeId>,
    /// Recent episode texts of the owner, newest first
    pub recent: Vec<String>,
}

/// What a resolution produced
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Entities referenced by the text, in their stored state
    pub entities: Vec<Entity>,
    /// Facts created or reinforced, in their stored state
    pub facts: Vec<Fact>,
    pub created_entities: usize,
    pub created_facts: usize,
}

impl Resolution {
    pub fn fact_ids(&self) -> Vec<FactId> {
        self.facts.iter().map(|f| f.id).collect()
    }
}

/// Extraction output before resolution
struct Candidates {
    entities: Vec<ExtractedEntity>,
    /// Relationships already known (cascade); `None` means ask the extractor
    relationships: Option<Vec<ExtractedRelationship>>,
}

impl From<CandidateGraph> for Candidates {
    fn from(graph: CandidateGraph) -> Self {
        let relationships = graph
            .edges
            .iter()
            .filter_map(|edge| {
                let source = graph.node(&edge.source)?;
                let target = graph.node(&edge.target)?;
                Some(ExtractedRelationship::new(
                    source.name.clone(),
                    edge.relation.as_str(),
                    target.name.clone(),
                    edge.fact.clone(),
                ))
            })
            .collect();
        let entities = graph
            .nodes
            .into_iter()
            .map(|n| ExtractedEntity::new(n.name, n.entity_type))
            .collect();
        Self {
            entities,
            relationships: Some(relationships),
        }
    }
}

/// Entity and relationship resolver
pub struct Resolver {
    store: Arc<dyn GraphStore>,
    extractor: Arc<dyn Extractor>,
    embedder: Option<Arc<dyn Embedder>>,
    cascade: Option<CascadeExtractor>,
    config: ResolverConfig,
    retry: RetryPolicy,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn GraphStore>,
        extractor: Arc<dyn Extractor>,
        embedder: Option<Arc<dyn Embedder>>,
        config: ResolverConfig,
        cascade: CascadeConfig,
        retry: RetryPolicy,
    ) -> Self {
        let cascade = (config.strategy == ExtractionStrategy::Cascade)
            .then(|| CascadeExtractor::new(extractor.clone(), cascade, retry.clone()));
        Self {
            store,
            extractor,
            embedder,
            cascade,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve `text` into entities and facts of `owner`.
    ///
    /// Collaborator failures abort after retries; records written before
    /// the failure stay. Malformed single candidates are skipped.
    #[instrument(skip(self, text, context), fields(episode = ?context.episode_id))]
    pub async fn resolve(
        &self,
        text: &str,
        owner: &str,
        context: &ResolutionContext,
    ) -> Result<Resolution> {
        let candidates = self.extract_candidates(text, owner, context).await?;
        let mut resolution = Resolution::default();

        let (entities, by_name) = self
            .resolve_entities(owner, candidates.entities, &mut resolution)
            .await?;
        if entities.is_empty() {
            tracing::debug!("No entities extracted");
            return Ok(resolution);
        }

        let relationships = match candidates.relationships {
            Some(relationships) => relationships,
            None => {
                let names: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
                with_retry(&self.retry, "extract_relationships", || {
                    self.extractor
                        .extract_relationships(text, &names, owner, &context.recent)
                })
                .await?
            }
        };

        let facts = self
            .resolve_facts(owner, relationships, &by_name, context.episode_id, &mut resolution)
            .await?;

        if let Some(episode_id) = context.episode_id {
            for entity in &entities {
                self.store
                    .save_mention(&Mention::new(episode_id, entity.id))
                    .await?;
            }
        }

        resolution.entities = self.refresh_summaries(entities, text).await;
        resolution.facts = facts;
        tracing::info!(
            "Resolved {} entities ({} new) and {} facts ({} new)",
            resolution.entities.len(),
            resolution.created_entities,
            resolution.facts.len(),
            resolution.created_facts
        );
        Ok(resolution)
    }

    async fn extract_candidates(
        &self,
        text: &str,
        owner: &str,
        context: &ResolutionContext,
    ) -> Result<Candidates> {
        if let Some(cascade) = &self.cascade {
            return Ok(cascade.extract(text, &context.recent).await?.into());
        }
        let entities = with_retry(&self.retry, "extract_entities", || {
            self.extractor.extract_entities(text, owner, &context.recent)
        })
        .await?;
        Ok(Candidates {
            entities,
            relationships: None,
        })
    }

    /// Steps 1-3: collapse, embed, match or create
    async fn resolve_entities(
        &self,
        owner: &str,
        candidates: Vec<ExtractedEntity>,
        resolution: &mut Resolution,
    ) -> Result<(Vec<Entity>, HashMap<String, EntityId>)> {
        let mut seen = HashSet::new();
        let candidates: Vec<ExtractedEntity> = candidates
            .into_iter()
            .filter(|c| match c.validate() {
                Ok(()) => seen.insert(normalize_name(&c.name)),
                Err(reason) => {
                    tracing::warn!("Skipping entity candidate {:?}: {}", c.name, reason);
                    false
                }
            })
            .collect();
        if candidates.is_empty() {
            return Ok((Vec::new(), HashMap::new()));
        }

        let texts: Vec<String> = candidates
            .iter()
            .map(|c| {
                Entity::embedding_text(c.name.trim(), &EntityType::from(c.entity_type.as_str()))
            })
            .collect();
        let embeddings = self.embed_all("embed_entities", &texts).await?;

        let mut entities: Vec<Entity> = Vec::new();
        let mut by_name = HashMap::new();
        for (candidate, embedding) in candidates.into_iter().zip(embeddings) {
            let name = candidate.name.trim().to_string();
            let entity_type = EntityType::from(candidate.entity_type.as_str());

            let entity = match self.find_entity(owner, &name, embedding.as_deref()).await? {
                Some(mut existing) => {
                    if let Some(done) = entities.iter().find(|e| e.id == existing.id) {
                        // Two surface names resolved to the same entity
                        by_name.insert(normalize_name(&name), done.id);
                        continue;
                    }
                    existing.record_mention();
                    if existing.name_embedding.is_none() {
                        existing.name_embedding = embedding;
                    }
                    tracing::debug!("Merged {:?} into entity {}", name, existing.id);
                    existing
                }
                None => {
                    let mut created = Entity::new(owner, name.clone(), entity_type);
                    created.name_embedding = embedding;
                    resolution.created_entities += 1;
                    tracing::debug!("Created entity {} for {:?}", created.id, name);
                    created
                }
            };
            self.store.save_entity(&entity).await?;
            by_name.insert(normalize_name(&name), entity.id);
            by_name.insert(normalize_name(&entity.name), entity.id);
            entities.push(entity);
        }
        Ok((entities, by_name))
    }

    /// Best same-owner match: similarity, then mention count, then recency
    async fn find_entity(
        &self,
        owner: &str,
        name: &str,
        embedding: Option<&[f32]>,
    ) -> Result<Option<Entity>> {
        let candidates: Vec<(Entity, f32)> = match embedding {
            Some(embedding) => {
                let query = VectorQuery::new(
                    embedding.to_vec(),
                    self.config.entity_threshold,
                    self.config.entity_candidates.max(1),
                )
                .owner(owner);
                self.store.search_entities(&query).await?
            }
            None => {
                let key = normalize_name(name);
                self.store
                    .entities_for_owner(owner)
                    .await?
                    .into_iter()
                    .filter(|e| normalize_name(&e.name) == key)
                    .map(|e| (e, 1.0))
                    .collect()
            }
        };

        Ok(candidates
            .into_iter()
            .max_by(|(a, sa), (b, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.mention_count.cmp(&b.mention_count))
                    .then(a.updated_at.cmp(&b.updated_at))
            })
            .map(|(entity, _)| entity))
    }

    /// Steps 4-5: map endpoints, embed, match or create
    async fn resolve_facts(
        &self,
        owner: &str,
        relationships: Vec<ExtractedRelationship>,
        by_name: &HashMap<String, EntityId>,
        episode_id: Option<EpisodeId>,
        resolution: &mut Resolution,
    ) -> Result<Vec<Fact>> {
        let mut resolvable = Vec::new();
        for rel in relationships {
            if let Err(reason) = rel.validate() {
                tracing::warn!("Skipping relationship candidate: {}", reason);
                continue;
            }
            let source = by_name.get(&normalize_name(&rel.source));
            let target = by_name.get(&normalize_name(&rel.destination));
            match (source, target) {
                (Some(&source), Some(&target)) => resolvable.push((source, target, rel)),
                _ => tracing::warn!(
                    "Dropping relationship {} -[{}]-> {}: endpoint not resolved",
                    rel.source,
                    rel.relation,
                    rel.destination
                ),
            }
        }
        if resolvable.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = resolvable.iter().map(|(_, _, r)| r.fact_text()).collect();
        let embeddings = self.embed_all("embed_facts", &texts).await?;

        let mut facts: Vec<Fact> = Vec::new();
        for (((source, target, rel), text), embedding) in
            resolvable.into_iter().zip(texts).zip(embeddings)
        {
            let relation = Relation::new(&rel.relation);
            let existing = self
                .find_fact(source, target, &relation, &text, embedding.as_deref())
                .await?;

            let fact = match existing {
                Some(mut fact) => {
                    if let Some(done) = facts.iter_mut().find(|f| f.id == fact.id) {
                        if let Some(episode) = episode_id {
                            done.add_episode(episode);
                        }
                        continue;
                    }
                    fact.mention_count = fact.mention_count.saturating_add(1);
                    fact.fact = text;
                    if embedding.is_some() {
                        fact.embedding = embedding;
                    }
                    if let Some(episode) = episode_id {
                        fact.add_episode(episode);
                    }
                    fact
                }
                None => {
                    let mut fact = Fact::new(owner, source, target, relation, text);
                    fact.embedding = embedding;
                    if let Some(episode) = episode_id {
                        fact.add_episode(episode);
                    }
                    resolution.created_facts += 1;
                    fact
                }
            };
            facts.push(fact);
        }

        for fact in &facts {
            self.store.save_fact(fact).await?;
        }
        Ok(facts)
    }

    /// Live, still-valid fact between the ordered pair that says the same thing
    async fn find_fact(
        &self,
        source: EntityId,
        target: EntityId,
        relation: &Relation,
        text: &str,
        embedding: Option<&[f32]>,
    ) -> Result<Option<Fact>> {
        let now = Utc::now();
        let existing = self
            .store
            .facts_between(source, target)
            .await?
            .into_iter()
            .filter(|f| f.temporal.is_live_at(now) && !f.temporal.is_invalidated());

        let best = match embedding {
            Some(embedding) => existing
                .filter_map(|f| {
                    let similarity = cosine_similarity(embedding, f.embedding.as_deref()?);
                    (similarity >= self.config.fact_threshold).then_some((f, similarity))
                })
                .max_by(|(a, sa), (b, sb)| {
                    sa.partial_cmp(sb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.mention_count.cmp(&b.mention_count))
                })
                .map(|(f, _)| f),
            None => {
                let key = normalize_name(text);
                existing
                    .filter(|f| &f.relation == relation && normalize_name(&f.fact) == key)
                    .max_by_key(|f| f.mention_count)
            }
        };
        Ok(best)
    }

    /// Embed texts in one batch; `None` per text when embeddings are off
    async fn embed_all(&self, operation: &str, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let Some(embedder) = &self.embedder else {
            return Ok(vec![None; texts.len()]);
        };
        let vectors = with_retry(&self.retry, operation, || embedder.embed_batch(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(crate::error::MemoryError::malformed(
                operation,
                format!("got {} vectors for {} texts", vectors.len(), texts.len()),
            ));
        }
        Ok(vectors.into_iter().map(Some).collect())
    }

    /// Regenerate summaries; failures keep the previous summary
    async fn refresh_summaries(&self, entities: Vec<Entity>, text: &str) -> Vec<Entity> {
        let mut refreshed = Vec::with_capacity(entities.len());
        for mut entity in entities {
            match self.summarize(&entity, text).await {
                Ok(summary) => {
                    entity.summary = summary;
                    entity.updated_at = Utc::now();
                    if let Err(e) = self.store.save_entity(&entity).await {
                        tracing::warn!("Failed to save summary of {}: {}", entity.id, e);
                    }
                }
                Err(e) => tracing::warn!("Summary regeneration failed for {}: {}", entity.id, e),
            }
            refreshed.push(entity);
        }
        refreshed
    }

    async fn summarize(&self, entity: &Entity, text: &str) -> Result<String> {
        let mut facts: Vec<Fact> = self
            .store
            .facts_for_entity(entity.id)
            .await?
            .into_iter()
            .filter(|f| f.is_live())
            .collect();
        facts.sort_by(|a, b| b.temporal.created_at.cmp(&a.temporal.created_at));
        facts.truncate(self.config.summary_relationships);

        let relationships: Vec<String> = facts.iter().map(|f| format!("- {}", f.fact)).collect();
        let prompt = format!(
            "Update the summary of {} ({}).\nCurrent summary: {}\nRecent relationships:\n{}\nNew context:\n{}",
            entity.name,
            entity.entity_type,
            if entity.summary.is_empty() { "(none)" } else { entity.summary.as_str() },
            relationships.join("\n"),
            text
        );

        let schema = EntitySummary::schema();
        let summary: EntitySummary = with_retry(&self.retry, "summarize_entity", || async {
            let value = self.extractor.structured_output(&prompt, &schema).await?;
            parse_structured("summarize_entity", value)
        })
        .await?;
        Ok(summary.summary.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryGraphStore;
    use crate::testing::{HashEmbedder, ScriptedExtractor};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryGraphStore>,
        extractor: Arc<ScriptedExtractor>,
        resolver: Resolver,
    }

    fn fixture(config: ResolverConfig, embeddings: bool) -> Fixture {
        let store = Arc::new(InMemoryGraphStore::new());
        let extractor = Arc::new(
            ScriptedExtractor::new()
                .entity_type("Alice", "person")
                .entity_type("Google", "organization"),
        );
        let embedder: Option<Arc<dyn Embedder>> = if embeddings {
            Some(Arc::new(HashEmbedder::new(256)))
        } else {
            None
        };
        let resolver = Resolver::new(
            store.clone(),
            extractor.clone(),
            embedder,
            config,
            CascadeConfig::default(),
            RetryPolicy::immediate(2),
        );
        Fixture {
            store,
            extractor,
            resolver,
        }
    }

    fn with_episode() -> ResolutionContext {
        ResolutionContext {
            episode_id: Some(EpisodeId::new()),
            recent: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let fx = fixture(ResolverConfig::default(), true);
        let first = fx
            .resolver
            .resolve("Alice works at Google.", "u1", &with_episode())
            .await
            .unwrap();
        assert_eq!(first.created_entities, 2);
        assert_eq!(first.created_facts, 1);

        let second = fx
            .resolver
            .resolve("Alice works at Google!", "u1", &with_episode())
            .await
            .unwrap();
        assert_eq!(second.created_entities, 0);
        assert_eq!(second.created_facts, 0);
        assert_eq!(fx.store.entity_count(), 2);
        assert_eq!(fx.store.fact_count(), 1);

        let alice = second.entities.iter().find(|e| e.name == "Alice").unwrap();
        assert_eq!(alice.mention_count, 2);
        assert_eq!(alice.entity_type, EntityType::Person);
        assert_eq!(second.facts[0].mention_count, 2);
        assert_eq!(second.facts[0].episodes.len(), 2);
    }

    #[tokio::test]
    async fn test_owners_do_not_share_entities() {
        let fx = fixture(ResolverConfig::default(), true);
        fx.resolver
            .resolve("Alice works at Google", "u1", &ResolutionContext::default())
            .await
            .unwrap();
        let other = fx
            .resolver
            .resolve("Alice works at Google", "u2", &ResolutionContext::default())
            .await
            .unwrap();
        assert_eq!(other.created_entities, 2);
        assert_eq!(fx.store.entity_count(), 4);
    }

    #[tokio::test]
    async fn test_exact_names_without_embeddings() {
        let fx = fixture(ResolverConfig::default(), false);
        fx.resolver
            .resolve("Alice works at Google", "u1", &ResolutionContext::default())
            .await
            .unwrap();
        let again = fx
            .resolver
            .resolve("ALICE works at Google", "u1", &ResolutionContext::default())
            .await
            .unwrap();
        // "ALICE" normalizes to the stored name
        assert_eq!(again.created_entities, 0);
        assert_eq!(fx.store.entity_count(), 2);
    }

    #[tokio::test]
    async fn test_mentions_written_per_entity() {
        let fx = fixture(ResolverConfig::default(), true);
        let context = with_episode();
        let resolution = fx
            .resolver
            .resolve("Alice met Bob", "u1", &context)
            .await
            .unwrap();
        let mentioned = fx
            .store
            .mentions_for_episode(context.episode_id.unwrap())
            .await
            .unwrap();
        assert_eq!(mentioned.len(), resolution.entities.len());
        assert_eq!(resolution.facts[0].relation.as_str(), "MET");
    }

    #[tokio::test]
    async fn test_entity_extraction_failure_surfaces_after_retries() {
        let fx = fixture(ResolverConfig::default(), true);
        fx.extractor.fail_next("extract_entities", 5);
        let err = fx
            .resolver
            .resolve("Alice works at Google", "u1", &ResolutionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::MemoryError::RetriesExhausted { attempts: 2, .. }
        ));
        assert_eq!(fx.store.entity_count(), 0);
    }

    #[tokio::test]
    async fn test_summary_failure_is_not_fatal() {
        let fx = fixture(ResolverConfig::default(), true);
        fx.extractor.fail_next("structured_output", 10);
        let resolution = fx
            .resolver
            .resolve("Alice works at Google", "u1", &ResolutionContext::default())
            .await
            .unwrap();
        assert_eq!(resolution.entities.len(), 2);
        assert!(resolution.entities.iter().all(|e| e.summary.is_empty()));
    }

    #[tokio::test]
    async fn test_summary_uses_recent_relationships() {
        let fx = fixture(ResolverConfig::default(), true);
        let resolution = fx
            .resolver
            .resolve("Alice works at Google", "u1", &ResolutionContext::default())
            .await
            .unwrap();
        let alice = resolution.entities.iter().find(|e| e.name == "Alice").unwrap();
        assert_eq!(alice.summary, "Alice works at Google");
        let stored = fx.store.get_entity(alice.id).await.unwrap().unwrap();
        assert_eq!(stored.summary, alice.summary);
    }

    #[tokio::test]
    async fn test_cascade_strategy_feeds_resolution() {
        let config = ResolverConfig {
            strategy: ExtractionStrategy::Cascade,
            ..ResolverConfig::default()
        };
        let fx = fixture(config, true);
        fx.extractor.respond(
            "node_discovery",
            json!({"nodes": [{"name": "Alice", "type": "person"}, {"name": "Google", "type": "organization"}]}),
        );
        fx.extractor.respond(
            "triplet_extraction",
            json!({"triplets": [
                {"source": "alice", "target": "google", "relation": "works at", "fact": "Alice works at Google"},
                {"source": "alice", "target": "Paris", "relation": "lives in"}
            ]}),
        );

        let resolution = fx
            .resolver
            .resolve("Alice works at Google", "u1", &ResolutionContext::default())
            .await
            .unwrap();
        assert_eq!(resolution.created_entities, 2);
        assert_eq!(resolution.facts.len(), 1);
        assert_eq!(resolution.facts[0].relation.as_str(), "WORKS_AT");
        assert_eq!(fx.extractor.calls("extract_entities"), 0);
    }
}
