//! Reciprocal Rank Fusion.
//!
//! A candidate appearing in several ranked lists earns
//! `Σ 1/(κ + rank)` over the lists that contain it, rank counted from
//! 1. κ = 60 by convention; it damps the head of each list so no
//! single ranker dominates.

use std::collections::HashMap;
use uuid::Uuid;

pub const RRF_K: f64 = 60.0;

/// Fuse ranked candidate lists into a score per candidate.
pub fn rrf_fuse(lists: &[Vec<Uuid>], k: f64) -> HashMap<Uuid, f64> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();
    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(*id).or_default() += 1.0 / (k + rank as f64 + 1.0);
        }
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_in_both_lists_beats_single_list_winner() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let c = Uuid::now_v7();
        // `b` is second in both lists; `a` and `c` each lead one.
        let scores = rrf_fuse(&[vec![a, b], vec![c, b]], RRF_K);
        assert!(scores[&b] > scores[&a]);
        assert!(scores[&b] > scores[&c]);
    }

    #[test]
    fn rank_one_scores_highest_within_a_list() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let scores = rrf_fuse(&[vec![a, b]], RRF_K);
        assert!(scores[&a] > scores[&b]);
        assert!((scores[&a] - 1.0 / 61.0).abs() < 1e-12);
        assert!((scores[&b] - 1.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn empty_lists_fuse_to_nothing() {
        assert!(rrf_fuse(&[], RRF_K).is_empty());
        assert!(rrf_fuse(&[vec![], vec![]], RRF_K).is_empty());
    }
}
