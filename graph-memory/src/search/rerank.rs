//! Score post-processing: temporal decay and update boost

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Scored, SearchItem};
use crate::temporal::{age_days, days_before};

/// Multiply scores by `factor ^ age_days`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalDecay {
    /// Per-day decay (default: 0.95)
    pub factor: f64,
}

impl Default for TemporalDecay {
    fn default() -> Self {
        Self { factor: 0.95 }
    }
}

impl TemporalDecay {
    pub fn weight(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        self.factor.powf(age_days(created_at, now)) as f32
    }
}

/// Favor items created, or facts invalidated, within a recent window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateBoost {
    /// Multiplier for recent items (default: 1.2)
    pub factor: f32,
    /// Window length in days (default: 7)
    pub window_days: i64,
}

impl Default for UpdateBoost {
    fn default() -> Self {
        Self {
            factor: 1.2,
            window_days: 7,
        }
    }
}

impl UpdateBoost {
    /// Invalidation within the window takes precedence over creation
    pub fn weight(
        &self,
        created_at: DateTime<Utc>,
        invalid_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> f32 {
        let since = days_before(now, self.window_days);
        match invalid_at {
            Some(at) if at >= since => 0.8 * self.factor,
            _ if created_at >= since => self.factor,
            _ => 1.0,
        }
    }
}

/// Sort by score descending, ties by record id
pub(crate) fn sort_scored<T: SearchItem>(items: &mut [Scored<T>]) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.item.key().cmp(&b.item.key()))
    });
}

/// Apply decay and/or boost in place, then re-sort
pub(crate) fn apply<T: SearchItem>(
    items: &mut [Scored<T>],
    decay: Option<&TemporalDecay>,
    boost: Option<&UpdateBoost>,
    now: DateTime<Utc>,
) {
    if decay.is_none() && boost.is_none() {
        return;
    }
    for scored in items.iter_mut() {
        if let Some(decay) = decay {
            scored.score *= decay.weight(scored.item.created_at(), now);
        }
        if let Some(boost) = boost {
            scored.score *= boost.weight(scored.item.created_at(), scored.item.invalid_at(), now);
        }
    }
    sort_scored(items);
}
