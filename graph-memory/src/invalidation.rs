//! Contradiction detection and temporal invalidation
//!
//! New facts are compared against the owner's live facts that share an
//! endpoint with them. Facts the extractor judges superseded get
//! `invalid_at` set; nothing is deleted, so history stays queryable with
//! `as_of`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::instrument;

use crate::error::Result;
use crate::extraction::Extractor;
use crate::node::{EntityId, Fact, FactId};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::GraphStore;

/// Attribute holding the extractor's reason for an invalidation
pub const INVALIDATION_REASON: &str = "invalidation_reason";
/// Attribute holding the id of the fact that superseded this one
pub const INVALIDATED_BY: &str = "invalidated_by";

pub struct Invalidator {
    store: Arc<dyn GraphStore>,
    extractor: Arc<dyn Extractor>,
    retry: RetryPolicy,
}

impl Invalidator {
    pub fn new(store: Arc<dyn GraphStore>, extractor: Arc<dyn Extractor>, retry: RetryPolicy) -> Self {
        Self {
            store,
            extractor,
            retry,
        }
    }

    /// Invalidate existing facts contradicted by `new_facts`.
    ///
    /// Returns the facts that were invalidated by this call, in their
    /// stored state. Facts already invalid are never touched again.
    #[instrument(skip(self, new_facts), fields(new = new_facts.len()))]
    pub async fn invalidate_conflicts(&self, new_facts: &[Fact], owner: &str) -> Result<Vec<Fact>> {
        if new_facts.is_empty() {
            return Ok(Vec::new());
        }

        let existing = self.candidates(new_facts, owner).await?;
        if existing.is_empty() {
            tracing::debug!("No existing facts share an endpoint");
            return Ok(Vec::new());
        }

        let new_texts: Vec<String> = new_facts.iter().map(|f| f.fact.clone()).collect();
        let existing_texts: Vec<String> = existing.iter().map(|f| f.fact.clone()).collect();
        let contradictions = with_retry(&self.retry, "detect_contradictions", || {
            self.extractor
                .detect_contradictions(&new_texts, &existing_texts)
        })
        .await?;

        let now = Utc::now();
        let mut invalidated: Vec<Fact> = Vec::new();
        for contradiction in contradictions {
            let (Some(newer), Some(older)) = (
                new_facts.get(contradiction.new_index),
                existing.get(contradiction.existing_index),
            ) else {
                tracing::warn!(
                    "Ignoring contradiction with out-of-range indices ({}, {})",
                    contradiction.new_index,
                    contradiction.existing_index
                );
                continue;
            };
            if invalidated.iter().any(|f| f.id == older.id) {
                continue;
            }

            let mut fact = older.clone();
            if !fact.temporal.invalidate_at(now)? {
                continue;
            }
            fact.attributes
                .insert(INVALIDATION_REASON.to_string(), Value::String(contradiction.reason));
            fact.attributes
                .insert(INVALIDATED_BY.to_string(), Value::String(newer.id.to_string()));
            self.store.save_fact(&fact).await?;
            tracing::info!("Fact {} superseded by {}", fact.id, newer.id);
            invalidated.push(fact);
        }
        Ok(invalidated)
    }

    /// Live, not yet invalidated facts of `owner` touching the new facts' endpoints
    async fn candidates(&self, new_facts: &[Fact], owner: &str) -> Result<Vec<Fact>> {
        let exclude: HashSet<FactId> = new_facts.iter().map(|f| f.id).collect();
        let endpoints: HashSet<EntityId> = new_facts
            .iter()
            .flat_map(|f| [f.source, f.target])
            .collect();

        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut existing = Vec::new();
        for entity in endpoints {
            for fact in self.store.facts_for_entity(entity).await? {
                if fact.owner == owner
                    && !exclude.contains(&fact.id)
                    && fact.temporal.is_live_at(now)
                    && !fact.temporal.is_invalidated()
                    && seen.insert(fact.id)
                {
                    existing.push(fact);
                }
            }
        }
        // Stable indices for the extractor
        existing.sort_by(|a, b| {
            a.temporal
                .created_at
                .cmp(&b.temporal.created_at)
                .then(a.id.cmp(&b.id))
        });
        Ok(existing)
    }
}
