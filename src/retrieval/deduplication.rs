//! Merging of per-sub-query results by chunk id

use crate::retrieval::{sort_by_final_score, ScoredCandidate};
use crate::storage::ChunkId;
use ahash::AHashMap;

/// Merged pool ready for a second diversity pass
#[derive(Debug, Default)]
pub struct MergedResults {
    /// Sorted by relevance, one entry per chunk
    pub candidates: Vec<ScoredCandidate>,
    /// Best chunk of every sub-query that returned anything, in sub-query order
    pub pinned: Vec<ChunkId>,
}

/// Deduplicate sub-query results by chunk id, keeping the highest-scored instance
///
/// # Arguments
/// * `results` - `(sub-query order, candidates best first)` per sub-query
///
/// # Returns
/// One candidate per chunk with every originating sub-query recorded in
/// `origins`, reopened so diversity can run again over the merged set
pub fn merge_subquery_results(results: Vec<(usize, Vec<ScoredCandidate>)>) -> MergedResults {
    let mut merged: Vec<ScoredCandidate> = Vec::new();
    let mut positions: AHashMap<ChunkId, usize> = AHashMap::new();
    let mut pinned = Vec::new();

    let mut results = results;
    results.sort_by_key(|(order, _)| *order);

    for (order, candidates) in results {
        if let Some(best) = candidates.first() {
            if !pinned.contains(&best.id()) {
                pinned.push(best.id());
            }
        }

        for mut candidate in candidates {
            candidate.reopen_for_merge();
            match positions.get(&candidate.id()) {
                Some(&idx) => {
                    let existing = &mut merged[idx];
                    let mut origins = std::mem::take(&mut existing.origins);
                    if candidate.relevance() > existing.relevance() {
                        *existing = candidate;
                    }
                    if !origins.contains(&order) {
                        origins.push(order);
                    }
                    origins.sort_unstable();
                    existing.origins = origins;
                }
                None => {
                    candidate.origins = vec![order];
                    positions.insert(candidate.id(), merged.len());
                    merged.push(candidate);
                }
            }
        }
    }

    sort_by_final_score(&mut merged);
    MergedResults {
        candidates: merged,
        pinned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::QualityBreakdown;
    use crate::storage::Chunk;

    fn diversified(id: u64, relevance: f32) -> ScoredCandidate {
        let mut c = ScoredCandidate::fused(
            Chunk::new(id, format!("text {}", id), vec![], "a.pdf", id as u32, 0),
            relevance,
        );
        c.apply_quality(QualityBreakdown::default(), 0.0, 1.0);
        c.apply_diversity(0.0, 0.7);
        c
    }

    #[test]
    fn test_merge_keeps_best_and_records_origins() {
        let merged = merge_subquery_results(vec![
            (1, vec![diversified(2, 0.9), diversified(1, 0.2)]),
            (0, vec![diversified(1, 0.8), diversified(3, 0.1)]),
        ]);

        let ids: Vec<ChunkId> = merged.candidates.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![2, 1, 3]);

        let shared = &merged.candidates[1];
        assert!((shared.final_score - 0.8).abs() < 1e-6);
        assert_eq!(shared.origins, vec![0, 1]);
        assert_eq!(merged.candidates[0].origins, vec![1]);

        // Reopened for the merged diversity pass
        assert!(merged.candidates.iter().all(|c| c.diversity_penalty == 0.0));
        assert_eq!(merged.pinned, vec![1, 2]);
    }

    #[test]
    fn test_empty_subquery_pins_nothing() {
        let merged = merge_subquery_results(vec![(0, vec![]), (1, vec![diversified(4, 0.5)])]);
        assert_eq!(merged.pinned, vec![4]);
        assert_eq!(merged.candidates.len(), 1);
    }
}
