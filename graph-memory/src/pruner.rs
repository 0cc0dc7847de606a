//! Memory pruning: expired facts, stale entities, redundant facts

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::embedding::cosine_similarity;
use crate::error::{MemoryError, Result};
use crate::node::{EntityId, Episode, Fact, FactId};
use crate::storage::GraphStore;
use crate::temporal::days_before;

/// What a prune run is allowed to remove
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneOptions {
    /// Delete facts expired longer ago than this (default: 30)
    pub expired_cutoff_days: i64,
    /// Entities mentioned fewer times are candidates; 0 disables (default: 0)
    pub min_mentions: u32,
    /// Candidate entities must be at least this old (default: 30)
    pub min_age_days: i64,
    /// Merge near-duplicate facts between the same pair (default: false)
    pub compact_redundant: bool,
    /// Cosine similarity at which facts count as duplicates (default: 0.95)
    pub similarity_threshold: f32,
    /// Report without writing (default: false)
    pub dry_run: bool,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            expired_cutoff_days: 30,
            min_mentions: 0,
            min_age_days: 30,
            compact_redundant: false,
            similarity_threshold: 0.95,
            dry_run: false,
        }
    }
}

impl PruneOptions {
    /// Reject negative windows and thresholds outside [0, 1]
    pub fn validate(&self) -> Result<()> {
        if self.expired_cutoff_days < 0 {
            return Err(MemoryError::validation("expired_cutoff_days is negative"));
        }
        if self.min_age_days < 0 {
            return Err(MemoryError::validation("min_age_days is negative"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(MemoryError::validation(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// Outcome of a prune run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub expired_facts_removed: usize,
    pub entities_removed: usize,
    /// Facts removed together with their entity
    pub orphaned_facts_removed: usize,
    pub facts_compacted: usize,
    pub deleted_entities: Vec<EntityId>,
    pub deleted_facts: Vec<FactId>,
    /// Compaction survivors, in their new state
    pub updated_facts: Vec<Fact>,
    /// Episodes whose `fact_ids` were rewritten, in their new state
    pub updated_episodes: Vec<Episode>,
    pub dry_run: bool,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.deleted_entities.is_empty()
            && self.deleted_facts.is_empty()
            && self.updated_facts.is_empty()
    }
}

pub struct Pruner {
    store: Arc<dyn GraphStore>,
}

impl Pruner {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, options), fields(dry_run = options.dry_run))]
    pub async fn prune(&self, owner: &str, options: &PruneOptions) -> Result<PruneReport> {
        options.validate()?;
        let mut report = PruneReport {
            dry_run: options.dry_run,
            ..PruneReport::default()
        };

        self.prune_expired(owner, options, &mut report).await?;
        self.prune_entities(owner, options, &mut report).await?;
        let mut absorbed = HashMap::new();
        if options.compact_redundant {
            self.compact(owner, options, &mut absorbed, &mut report).await?;
        }
        if !options.dry_run {
            self.relink_episodes(owner, &absorbed, &mut report).await?;
        }

        tracing::info!(
            "Pruned {} expired facts, {} entities ({} attached facts), compacted {} facts{}",
            report.expired_facts_removed,
            report.entities_removed,
            report.orphaned_facts_removed,
            report.facts_compacted,
            if options.dry_run { " (dry run)" } else { "" }
        );
        Ok(report)
    }

    async fn prune_expired(
        &self,
        owner: &str,
        options: &PruneOptions,
        report: &mut PruneReport,
    ) -> Result<()> {
        let cutoff = days_before(Utc::now(), options.expired_cutoff_days);
        for fact in self.store.facts_for_owner(owner).await? {
            if fact.temporal.expired_at.is_some_and(|at| at < cutoff) {
                self.delete_fact(fact.id, options, report).await?;
                report.expired_facts_removed += 1;
            }
        }
        Ok(())
    }

    async fn prune_entities(
        &self,
        owner: &str,
        options: &PruneOptions,
        report: &mut PruneReport,
    ) -> Result<()> {
        if options.min_mentions == 0 {
            return Ok(());
        }
        let cutoff = days_before(Utc::now(), options.min_age_days);

        for entity in self.store.entities_for_owner(owner).await? {
            if entity.mention_count >= options.min_mentions || entity.created_at > cutoff {
                continue;
            }
            for fact in self.store.facts_for_entity(entity.id).await? {
                if report.deleted_facts.contains(&fact.id) {
                    continue;
                }
                self.delete_fact(fact.id, options, report).await?;
                report.orphaned_facts_removed += 1;
            }
            if !options.dry_run {
                self.store.delete_mentions_for_entity(entity.id).await?;
                self.store.delete_entity(entity.id).await?;
            }
            tracing::debug!(
                "Removing entity {} ({:?}, {} mentions)",
                entity.id,
                entity.name,
                entity.mention_count
            );
            report.deleted_entities.push(entity.id);
            report.entities_removed += 1;
        }
        Ok(())
    }

    /// Merge near-duplicate live facts per directed pair
    async fn compact(
        &self,
        owner: &str,
        options: &PruneOptions,
        absorbed_into: &mut HashMap<FactId, FactId>,
        report: &mut PruneReport,
    ) -> Result<()> {
        let now = Utc::now();
        let deleted: HashSet<FactId> = report.deleted_facts.iter().copied().collect();

        let mut pairs: BTreeMap<(EntityId, EntityId), Vec<Fact>> = BTreeMap::new();
        for fact in self.store.facts_for_owner(owner).await? {
            if deleted.contains(&fact.id)
                || fact.embedding.is_none()
                || !fact.temporal.is_live_at(now)
                || fact.temporal.is_invalidated()
            {
                continue;
            }
            pairs.entry((fact.source, fact.target)).or_default().push(fact);
        }

        for (_, mut facts) in pairs {
            if facts.len() < 2 {
                continue;
            }
            // Survivor first: most mentioned, then oldest
            facts.sort_by(|a, b| {
                b.mention_count
                    .cmp(&a.mention_count)
                    .then(a.temporal.created_at.cmp(&b.temporal.created_at))
                    .then(a.id.cmp(&b.id))
            });

            let mut merged = vec![false; facts.len()];
            for i in 0..facts.len() {
                if merged[i] {
                    continue;
                }
                let mut survivor = facts[i].clone();
                let mut absorbed = Vec::new();
                for j in (i + 1)..facts.len() {
                    if merged[j] || !similar(&survivor, &facts[j], options.similarity_threshold) {
                        continue;
                    }
                    merged[j] = true;
                    let duplicate = &facts[j];
                    survivor.mention_count =
                        survivor.mention_count.saturating_add(duplicate.mention_count);
                    for episode in &duplicate.episodes {
                        survivor.add_episode(*episode);
                    }
                    if duplicate.temporal.valid_at > survivor.temporal.valid_at {
                        survivor.temporal.set_valid_at(duplicate.temporal.valid_at)?;
                    }
                    absorbed.push(duplicate.id);
                }
                if absorbed.is_empty() {
                    continue;
                }

                if !options.dry_run {
                    self.store.save_fact(&survivor).await?;
                }
                for id in absorbed {
                    absorbed_into.insert(id, survivor.id);
                    self.delete_fact(id, options, report).await?;
                    report.facts_compacted += 1;
                }
                report.updated_facts.push(survivor);
            }
        }
        Ok(())
    }

    /// Point episode `fact_ids` at compaction survivors and drop deleted ids
    async fn relink_episodes(
        &self,
        owner: &str,
        absorbed: &HashMap<FactId, FactId>,
        report: &mut PruneReport,
    ) -> Result<()> {
        if report.deleted_facts.is_empty() {
            return Ok(());
        }
        let mut replacements: HashMap<FactId, Option<FactId>> =
            report.deleted_facts.iter().map(|id| (*id, None)).collect();
        for (absorbed, survivor) in absorbed {
            replacements.insert(*absorbed, Some(*survivor));
        }

        for mut episode in self.store.episodes_for_owner(owner).await? {
            if !episode.fact_ids.iter().any(|id| replacements.contains_key(id)) {
                continue;
            }
            let mut fact_ids: Vec<FactId> = Vec::with_capacity(episode.fact_ids.len());
            for id in &episode.fact_ids {
                let kept = match replacements.get(id) {
                    Some(replacement) => *replacement,
                    None => Some(*id),
                };
                if let Some(kept) = kept {
                    if !fact_ids.contains(&kept) {
                        fact_ids.push(kept);
                    }
                }
            }
            episode.fact_ids = fact_ids;
            self.store.save_episode(&episode).await?;
            report.updated_episodes.push(episode);
        }
        Ok(())
    }

    async fn delete_fact(&self, id: FactId, options: &PruneOptions, report: &mut PruneReport) -> Result<()> {
        if !options.dry_run {
            self.store.delete_fact(id).await?;
        }
        report.deleted_facts.push(id);
        Ok(())
    }
}

fn similar(a: &Fact, b: &Fact, threshold: f32) -> bool {
    match (&a.embedding, &b.embedding) {
        (Some(x), Some(y)) => cosine_similarity(x, y) >= threshold,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Entity, EntityType, EpisodeId, Relation};
    use crate::storage::InMemoryGraphStore;
    use chrono::Duration;

    struct Graph {
        store: Arc<InMemoryGraphStore>,
        alice: Entity,
        google: Entity,
    }

    async fn graph(age_days: i64) -> Graph {
        let store = Arc::new(InMemoryGraphStore::new());
        let created = Utc::now() - Duration::days(age_days);
        let mut alice = Entity::new("u1", "Alice", EntityType::Person);
        let mut google = Entity::new("u1", "Google", EntityType::Organization);
        alice.created_at = created;
        google.created_at = created;
        google.record_mention();
        google.record_mention();
        store.save_entity(&alice).await.unwrap();
        store.save_entity(&google).await.unwrap();
        Graph {
            store,
            alice,
            google,
        }
    }

    fn fact(g: &Graph, text: &str, embedding: Vec<f32>) -> Fact {
        Fact::new("u1", g.alice.id, g.google.id, Relation::new("works at"), text)
            .with_embedding(embedding)
    }

    #[tokio::test]
    async fn test_default_options_remove_nothing_live() {
        let g = graph(400).await;
        let live = fact(&g, "Alice works at Google", vec![1.0, 0.0]);
        let mut invalidated = fact(&g, "Alice worked at Google", vec![0.0, 1.0]);
        invalidated.temporal.invalidate_at(Utc::now()).unwrap();
        g.store.save_fact(&live).await.unwrap();
        g.store.save_fact(&invalidated).await.unwrap();

        let report = Pruner::new(g.store.clone())
            .prune("u1", &PruneOptions::default())
            .await
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(g.store.entity_count(), 2);
        assert_eq!(g.store.fact_count(), 2);
    }

    #[tokio::test]
    async fn test_expired_facts_past_cutoff() {
        let g = graph(1).await;
        let mut old = fact(&g, "Alice worked at Google", vec![1.0, 0.0]);
        old.temporal.valid_at = Utc::now() - Duration::days(90);
        old.temporal.expire_at(Utc::now() - Duration::days(60)).unwrap();
        let mut recent = fact(&g, "Alice interned at Google", vec![0.0, 1.0]);
        recent.temporal.expire_at(Utc::now()).unwrap();
        g.store.save_fact(&old).await.unwrap();
        g.store.save_fact(&recent).await.unwrap();

        let report = Pruner::new(g.store.clone())
            .prune("u1", &PruneOptions::default())
            .await
            .unwrap();
        assert_eq!(report.expired_facts_removed, 1);
        assert_eq!(report.deleted_facts, vec![old.id]);
        assert!(g.store.get_fact(old.id).await.unwrap().is_none());
        assert!(g.store.get_fact(recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rare_old_entities_take_their_facts() {
        let g = graph(60).await;
        let f = fact(&g, "Alice works at Google", vec![1.0, 0.0]);
        g.store.save_fact(&f).await.unwrap();

        let options = PruneOptions {
            min_mentions: 2,
            ..PruneOptions::default()
        };
        let report = Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap();
        // Alice has 1 mention, Google 3
        assert_eq!(report.deleted_entities, vec![g.alice.id]);
        assert_eq!(report.orphaned_facts_removed, 1);
        assert!(g.store.get_entity(g.alice.id).await.unwrap().is_none());
        assert!(g.store.get_entity(g.google.id).await.unwrap().is_some());
        assert_eq!(g.store.fact_count(), 0);
    }

    #[tokio::test]
    async fn test_young_entities_survive() {
        let g = graph(2).await;
        let options = PruneOptions {
            min_mentions: 5,
            ..PruneOptions::default()
        };
        let report = Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap();
        assert!(report.deleted_entities.is_empty());
    }

    #[tokio::test]
    async fn test_compaction_merges_duplicates() {
        let g = graph(1).await;
        let (e1, e2) = (EpisodeId::new(), EpisodeId::new());
        let mut a = fact(&g, "Alice works at Google", vec![1.0, 0.0]).with_episode(e1);
        a.mention_count = 3;
        let mut b = fact(&g, "Alice is employed by Google", vec![0.99, 0.01]).with_episode(e2);
        b.temporal.valid_at = Utc::now();
        let c = fact(&g, "Alice dislikes Google", vec![0.0, 1.0]);
        for f in [&a, &b, &c] {
            g.store.save_fact(f).await.unwrap();
        }

        let options = PruneOptions {
            compact_redundant: true,
            ..PruneOptions::default()
        };
        let report = Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap();
        assert_eq!(report.facts_compacted, 1);
        assert_eq!(report.deleted_facts, vec![b.id]);

        let survivor = g.store.get_fact(a.id).await.unwrap().unwrap();
        assert_eq!(survivor.mention_count, 4);
        assert_eq!(survivor.episodes, vec![e1, e2]);
        assert_eq!(survivor.temporal.valid_at, b.temporal.valid_at);
        assert!(g.store.get_fact(c.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let g = graph(60).await;
        g.store
            .save_fact(&fact(&g, "Alice works at Google", vec![1.0, 0.0]))
            .await
            .unwrap();
        let options = PruneOptions {
            min_mentions: 2,
            dry_run: true,
            ..PruneOptions::default()
        };
        let report = Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.entities_removed, 1);
        assert_eq!(g.store.entity_count(), 2);
        assert_eq!(g.store.fact_count(), 1);
    }

    async fn episode_citing(g: &Graph, facts: &[&Fact]) -> Episode {
        let mut episode = Episode::builder()
            .owner("u1")
            .content("Alice works at Google")
            .build()
            .unwrap();
        episode.fact_ids = facts.iter().map(|f| f.id).collect();
        g.store.save_episode(&episode).await.unwrap();
        episode
    }

    #[tokio::test]
    async fn test_unbounded_windows_do_not_overflow() {
        let g = graph(60).await;
        let mut expired = fact(&g, "Alice worked at Google", vec![1.0, 0.0]);
        expired.temporal.valid_at = Utc::now() - Duration::days(90);
        expired.temporal.expire_at(Utc::now() - Duration::days(60)).unwrap();
        g.store.save_fact(&expired).await.unwrap();

        let options = PruneOptions {
            expired_cutoff_days: i64::MAX,
            min_mentions: 5,
            min_age_days: i64::MAX,
            ..PruneOptions::default()
        };
        let report = Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(g.store.fact_count(), 1);
        assert_eq!(g.store.entity_count(), 2);
    }

    #[tokio::test]
    async fn test_negative_windows_are_rejected() {
        let g = graph(1).await;
        let options = PruneOptions {
            expired_cutoff_days: -1,
            ..PruneOptions::default()
        };
        let err = Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let options = PruneOptions {
            similarity_threshold: 1.5,
            ..PruneOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[tokio::test]
    async fn test_pruned_facts_leave_episodes() {
        let g = graph(60).await;
        let f = fact(&g, "Alice works at Google", vec![1.0, 0.0]);
        g.store.save_fact(&f).await.unwrap();
        let episode = episode_citing(&g, &[&f]).await;

        let options = PruneOptions {
            min_mentions: 2,
            ..PruneOptions::default()
        };
        let report = Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap();
        assert_eq!(report.updated_episodes.len(), 1);
        let stored = g.store.get_episode(episode.id).await.unwrap().unwrap();
        assert!(stored.fact_ids.is_empty());
    }

    #[tokio::test]
    async fn test_compaction_relinks_episodes_to_survivor() {
        let g = graph(1).await;
        let mut a = fact(&g, "Alice works at Google", vec![1.0, 0.0]);
        a.mention_count = 3;
        let b = fact(&g, "Alice is employed by Google", vec![0.99, 0.01]);
        g.store.save_fact(&a).await.unwrap();
        g.store.save_fact(&b).await.unwrap();
        let both = episode_citing(&g, &[&a, &b]).await;
        let only_b = episode_citing(&g, &[&b]).await;

        let options = PruneOptions {
            compact_redundant: true,
            ..PruneOptions::default()
        };
        Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap();

        let stored = g.store.get_episode(both.id).await.unwrap().unwrap();
        assert_eq!(stored.fact_ids, vec![a.id]);
        let stored = g.store.get_episode(only_b.id).await.unwrap().unwrap();
        assert_eq!(stored.fact_ids, vec![a.id]);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_episodes() {
        let g = graph(60).await;
        let f = fact(&g, "Alice works at Google", vec![1.0, 0.0]);
        g.store.save_fact(&f).await.unwrap();
        let episode = episode_citing(&g, &[&f]).await;

        let options = PruneOptions {
            min_mentions: 2,
            dry_run: true,
            ..PruneOptions::default()
        };
        let report = Pruner::new(g.store.clone()).prune("u1", &options).await.unwrap();
        assert!(report.updated_episodes.is_empty());
        let stored = g.store.get_episode(episode.id).await.unwrap().unwrap();
        assert_eq!(stored.fact_ids, vec![f.id]);
    }
}
