//! HNSW vector index
//!
//! Approximate nearest-neighbour candidates via instant-distance. Writes
//! since the last build are tracked as pending and scanned exactly; the
//! graph is rebuilt once enough of them pile up.

use std::collections::{BTreeMap, HashSet};

use instant_distance::{Builder, HnswMap, Point, Search};
use parking_lot::RwLock;

use crate::embedding::cosine_similarity;

/// Pending writes tolerated before a rebuild, at minimum
const REBUILD_MIN_PENDING: usize = 256;

/// HNSW point wrapper for semantic search
#[derive(Clone)]
struct VectorPoint {
    vector: Vec<f32>,
}

impl Point for VectorPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Cosine distance = 1 - similarity (HNSW finds minimum)
        1.0 - cosine_similarity(&self.vector, &other.vector)
    }
}

#[derive(Default)]
struct Points {
    vectors: BTreeMap<String, Vec<f32>>,
    /// Ids upserted or removed since the graph was built
    pending: HashSet<String>,
}

impl Points {
    fn needs_rebuild(&self) -> bool {
        !self.pending.is_empty()
            && self.pending.len() >= REBUILD_MIN_PENDING.max(self.vectors.len() / 10)
    }
}

/// Vectors of one record collection keyed by record id
pub(crate) struct VectorIndex {
    points: RwLock<Points>,
    hnsw: RwLock<Option<HnswMap<VectorPoint, String>>>,
}

impl VectorIndex {
    pub(crate) fn new() -> Self {
        Self {
            points: RwLock::new(Points::default()),
            hnsw: RwLock::new(None),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.points.read().vectors.len()
    }

    /// Writes not yet folded into the graph
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.points.read().pending.len()
    }

    /// Insert or replace the vector of `id`
    pub(crate) fn upsert(&self, id: String, vector: Vec<f32>) {
        let mut points = self.points.write();
        points.pending.insert(id.clone());
        points.vectors.insert(id, vector);
    }

    pub(crate) fn remove(&self, id: &str) {
        let mut points = self.points.write();
        if points.vectors.remove(id).is_some() {
            points.pending.insert(id.to_string());
        }
    }

    /// Candidate ids ordered by similarity, as many as the graph yields
    /// plus every pending point
    pub(crate) fn candidates(&self, query: &[f32]) -> Vec<(String, f32)> {
        if self.points.read().needs_rebuild() {
            self.rebuild();
        }

        let points = self.points.read();
        let guard = self.hnsw.read();
        let mut hits = Vec::new();

        if let Some(hnsw) = guard.as_ref() {
            let query_point = VectorPoint {
                vector: query.to_vec(),
            };
            let mut search = Search::default();
            for item in hnsw.search(&query_point, &mut search) {
                // Pending ids are scored from their current vector below
                if points.pending.contains(item.value) {
                    continue;
                }
                hits.push((
                    item.value.clone(),
                    cosine_similarity(query, &item.point.vector),
                ));
            }
        }
        for id in &points.pending {
            if let Some(vector) = points.vectors.get(id) {
                hits.push((id.clone(), cosine_similarity(query, vector)));
            }
        }

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits
    }

    /// Rebuild HNSW index from every current vector
    fn rebuild(&self) {
        let mut points = self.points.write();
        if !points.needs_rebuild() {
            return;
        }

        let mut hnsw = self.hnsw.write();
        if points.vectors.is_empty() {
            *hnsw = None;
        } else {
            let (ids, vectors): (Vec<String>, Vec<VectorPoint>) = points
                .vectors
                .iter()
                .map(|(id, vector)| {
                    (
                        id.clone(),
                        VectorPoint {
                            vector: vector.clone(),
                        },
                    )
                })
                .unzip();
            *hnsw = Some(Builder::default().ef_construction(100).build(vectors, ids));
        }
        points.pending.clear();
        tracing::debug!("Rebuilt HNSW index over {} vectors", points.vectors.len());
    }
}
