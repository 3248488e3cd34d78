//! In-memory kNN over entity and edge embeddings.
//!
//! An HNSW graph serves steady-state queries; inserts mark the index
//! stale, and a stale index answers by exact scan so reads always see
//! the latest writes. `maybe_rebuild` folds accumulated inserts back
//! into the HNSW graph once enough have piled up.

use instant_distance::{Builder, HnswMap, Point, Search};
use rayon::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Result, WeaveError};
use crate::types::Embedding;

/// Inserts tolerated before a search triggers a rebuild.
const REBUILD_THRESHOLD: usize = 256;

#[derive(Clone, Debug)]
struct EmbeddingPoint(Vec<f32>);

impl Point for EmbeddingPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Cosine distance = 1 - cosine similarity
        let dot: f32 = self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum();
        let norm_a: f32 = self.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = other.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 1.0;
        }
        1.0 - dot / (norm_a * norm_b)
    }
}

/// A scored neighbor.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub id: Uuid,
    /// Cosine similarity, clamped to [0, 1].
    pub score: f32,
}

/// kNN index over one embedding family (entities or edges), with a
/// group tag per vector for namespace filtering.
pub struct KnnIndex {
    index: Option<HnswMap<EmbeddingPoint, Uuid>>,
    vectors: HashMap<Uuid, (String, Vec<f32>)>,
    dimension: usize,
    dirty: usize,
}

impl KnnIndex {
    pub fn new(dimension: usize) -> Self {
        KnnIndex {
            index: None,
            vectors: HashMap::new(),
            dimension,
            dirty: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn insert(&mut self, id: Uuid, group_id: &str, embedding: &Embedding) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(WeaveError::Validation(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        self.vectors
            .insert(id, (group_id.to_string(), embedding.clone()));
        self.dirty += 1;
        Ok(())
    }

    pub fn remove(&mut self, id: Uuid) {
        if self.vectors.remove(&id).is_some() {
            self.dirty += 1;
        }
    }

    /// Top-`k` by cosine similarity, optionally restricted to groups.
    /// An empty group slice means no restriction.
    pub fn search(&self, query: &Embedding, k: usize, groups: &[String]) -> Vec<Neighbor> {
        if k == 0 || self.vectors.is_empty() {
            return Vec::new();
        }
        if self.dirty > 0 || self.index.is_none() {
            return self.exact_search(query, k, groups);
        }

        let index = self.index.as_ref().unwrap();
        let query_point = EmbeddingPoint(query.clone());
        let mut search = Search::default();
        let mut out = Vec::new();
        for item in index.search(&query_point, &mut search).take(k * 10) {
            let id = *item.value;
            // The HNSW map can lag behind removals; the catalog is truth.
            let Some((group, _)) = self.vectors.get(&id) else {
                continue;
            };
            if !groups.is_empty() && !groups.iter().any(|g| g == group) {
                continue;
            }
            out.push(Neighbor {
                id,
                score: (1.0 - item.distance).clamp(0.0, 1.0),
            });
            if out.len() >= k {
                break;
            }
        }
        out
    }

    fn exact_search(&self, query: &Embedding, k: usize, groups: &[String]) -> Vec<Neighbor> {
        let query_point = EmbeddingPoint(query.clone());
        let mut scored: Vec<Neighbor> = self
            .vectors
            .par_iter()
            .filter(|(_, (group, _))| groups.is_empty() || groups.iter().any(|g| g == group))
            .map(|(id, (_, vec))| Neighbor {
                id: *id,
                score: (1.0 - query_point.distance(&EmbeddingPoint(vec.clone()))).clamp(0.0, 1.0),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Rebuild the HNSW graph from the catalog.
    pub fn rebuild(&mut self) {
        if self.vectors.is_empty() {
            self.index = None;
            self.dirty = 0;
            return;
        }
        let mut points = Vec::with_capacity(self.vectors.len());
        let mut values = Vec::with_capacity(self.vectors.len());
        for (id, (_, vec)) in &self.vectors {
            points.push(EmbeddingPoint(vec.clone()));
            values.push(*id);
        }
        self.index = Some(Builder::default().build(points, values));
        self.dirty = 0;
    }

    /// Rebuild only once enough inserts accumulated to make the exact
    /// fallback scan worth replacing.
    pub fn maybe_rebuild(&mut self) {
        if self.dirty >= REBUILD_THRESHOLD {
            self.rebuild();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_search_without_rebuild_sees_new_vectors() {
        let mut index = KnnIndex::new(3);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        index.insert(a, "g1", &vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(b, "g1", &vec![0.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&vec![1.0, 0.0, 0.0], 2, &[]);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, a);
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn group_filter_restricts_results() {
        let mut index = KnnIndex::new(3);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        index.insert(a, "g1", &vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(b, "g2", &vec![0.9, 0.1, 0.0]).unwrap();

        let hits = index.search(&vec![1.0, 0.0, 0.0], 5, &["g2".to_string()]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, b);
    }

    #[test]
    fn rebuild_then_search_uses_hnsw_path() {
        let mut index = KnnIndex::new(3);
        for i in 0..10 {
            let mut v = vec![0.0, 0.0, 0.0];
            v[i % 3] = 1.0;
            index.insert(Uuid::now_v7(), "g", &v).unwrap();
        }
        let target = Uuid::now_v7();
        index.insert(target, "g", &vec![0.7, 0.7, 0.0]).unwrap();
        index.rebuild();

        let hits = index.search(&vec![0.7, 0.7, 0.0], 1, &[]);
        assert_eq!(hits[0].id, target);
    }

    #[test]
    fn removal_hides_vector_even_with_stale_hnsw() {
        let mut index = KnnIndex::new(3);
        let a = Uuid::now_v7();
        index.insert(a, "g", &vec![1.0, 0.0, 0.0]).unwrap();
        index.rebuild();
        index.remove(a);

        let hits = index.search(&vec![1.0, 0.0, 0.0], 5, &[]);
        assert!(hits.is_empty());
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut index = KnnIndex::new(3);
        assert!(index.insert(Uuid::now_v7(), "g", &vec![1.0]).is_err());
    }

    #[test]
    fn zero_query_matches_nothing_well() {
        let mut index = KnnIndex::new(3);
        index.insert(Uuid::now_v7(), "g", &vec![1.0, 0.0, 0.0]).unwrap();
        let hits = index.search(&vec![0.0, 0.0, 0.0], 5, &[]);
        // Degenerate query: cosine is undefined, distance pinned to 1.0.
        assert!(hits.iter().all(|h| h.score == 0.0));
    }
}
