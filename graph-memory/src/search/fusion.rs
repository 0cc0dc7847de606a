//! Reciprocal Rank Fusion

use std::collections::HashMap;
use std::hash::Hash;

/// Default RRF constant
pub const DEFAULT_RRF_K: f32 = 60.0;

/// Fuse ranked id lists: `score(id) = Σ 1 / (k + rank)`, rank 1-based.
///
/// Lists that do not contain an id contribute nothing. Output is sorted by
/// fused score descending, ties broken by id ascending, so identical inputs
/// always produce identical orderings.
pub fn reciprocal_rank_fusion<K>(rankings: &[Vec<K>], k: f32) -> Vec<(K, f32)>
where
    K: Clone + Eq + Hash + Ord,
{
    let mut fused: HashMap<K, f32> = HashMap::new();
    for ranking in rankings {
        for (position, id) in ranking.iter().enumerate() {
            let rank = (position + 1) as f32;
            *fused.entry(id.clone()).or_insert(0.0) += 1.0 / (k + rank);
        }
    }

    let mut results: Vec<(K, f32)> = fused.into_iter().collect();
    results.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    results
}
