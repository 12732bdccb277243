//! Reciprocal Rank Fusion for combining keyword and vector results

use crate::config::RetrievalConfig;
use crate::index::CandidateRef;
use crate::storage::ChunkId;
use ahash::AHashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Invalid weight configuration: weights must be positive")]
    InvalidWeights,

    #[error("Invalid RRF constant: {0}")]
    InvalidK(f32),
}

/// Configuration for fusion algorithm
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// RRF K constant (typically 60)
    pub rrf_k: f32,

    pub keyword_weight: f32,

    pub vector_weight: f32,
}

impl FusionConfig {
    pub fn new(rrf_k: f32, keyword_weight: f32, vector_weight: f32) -> Result<Self, FusionError> {
        if keyword_weight <= 0.0 || vector_weight <= 0.0 {
            return Err(FusionError::InvalidWeights);
        }
        if rrf_k <= 0.0 || !rrf_k.is_finite() {
            return Err(FusionError::InvalidK(rrf_k));
        }

        Ok(Self {
            rrf_k,
            keyword_weight,
            vector_weight,
        })
    }

    pub fn from_retrieval(config: &RetrievalConfig) -> Result<Self, FusionError> {
        Self::new(config.rrf_k, config.keyword_weight, config.vector_weight)
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            keyword_weight: 1.0,
            vector_weight: 1.0,
        }
    }
}

/// One fused entry with the per-backend positions it came from
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: ChunkId,
    pub fused_score: f32,
    pub keyword_rank: Option<usize>,
    pub keyword_score: Option<f32>,
    pub vector_rank: Option<usize>,
    pub vector_score: Option<f32>,
}

/// Apply Reciprocal Rank Fusion to combine two ranked lists
///
/// RRF formula: score(id) = sum over lists of: weight / (k + rank), rank 1-based.
/// A chunk found by only one backend still scores from that list.
///
/// Ties keep first-seen order with the keyword list walked first, so output is
/// deterministic for identical inputs.
///
/// # Arguments
/// * `keyword` - ranked hits from the keyword backend (may be empty when degraded)
/// * `vector` - ranked hits from the vector backend (may be empty when degraded)
/// * `limit` - cap on the fused list (`top_k_initial`)
///
/// # Returns
/// Fused hits sorted by score descending
pub fn reciprocal_rank_fusion(
    keyword: &[CandidateRef],
    vector: &[CandidateRef],
    config: &FusionConfig,
    limit: usize,
) -> Vec<FusedHit> {
    let mut hits: Vec<FusedHit> = Vec::with_capacity(keyword.len() + vector.len());
    let mut positions: AHashMap<ChunkId, usize> = AHashMap::new();

    for (rank, hit) in keyword.iter().enumerate() {
        // A backend listing the same id twice only counts its best position
        if positions.contains_key(&hit.id) {
            continue;
        }
        positions.insert(hit.id, hits.len());
        hits.push(FusedHit {
            id: hit.id,
            fused_score: config.keyword_weight / (config.rrf_k + rank as f32 + 1.0),
            keyword_rank: Some(rank),
            keyword_score: Some(hit.score),
            vector_rank: None,
            vector_score: None,
        });
    }

    for (rank, hit) in vector.iter().enumerate() {
        let rrf_score = config.vector_weight / (config.rrf_k + rank as f32 + 1.0);
        match positions.get(&hit.id) {
            Some(&idx) => {
                let entry = &mut hits[idx];
                if entry.vector_rank.is_none() {
                    entry.fused_score += rrf_score;
                    entry.vector_rank = Some(rank);
                    entry.vector_score = Some(hit.score);
                }
            }
            None => {
                positions.insert(hit.id, hits.len());
                hits.push(FusedHit {
                    id: hit.id,
                    fused_score: rrf_score,
                    keyword_rank: None,
                    keyword_score: None,
                    vector_rank: Some(rank),
                    vector_score: Some(hit.score),
                });
            }
        }
    }

    // Stable sort: equal scores keep insertion (keyword-first) order
    hits.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);

    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn refs(ids: &[ChunkId]) -> Vec<CandidateRef> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| CandidateRef::new(*id, 1.0 - i as f32 * 0.01))
            .collect()
    }

    #[test]
    fn test_rrf_basic() {
        let keyword = refs(&[2, 1, 4]);
        let vector = refs(&[1, 2, 3]);

        let fused = reciprocal_rank_fusion(&keyword, &vector, &FusionConfig::default(), 10);
        assert_eq!(fused.len(), 4);

        // IDs 1 and 2 appear in both lists
        let top: Vec<ChunkId> = fused.iter().take(2).map(|h| h.id).collect();
        assert!(top.contains(&1) && top.contains(&2));

        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].fused_score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_single_list_still_scores() {
        let fused = reciprocal_rank_fusion(&[], &refs(&[7, 8]), &FusionConfig::default(), 10);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].id, 7);
        assert!(fused[0].keyword_rank.is_none());
        assert_eq!(fused[0].vector_rank, Some(0));
        assert!((fused[0].fused_score - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_prefer_keyword_order() {
        // 5 is keyword #1, 9 is vector #1: identical scores
        let fused = reciprocal_rank_fusion(&refs(&[5]), &refs(&[9]), &FusionConfig::default(), 10);
        assert_eq!(fused[0].id, 5);
        assert_eq!(fused[1].id, 9);

        let again = reciprocal_rank_fusion(&refs(&[5]), &refs(&[9]), &FusionConfig::default(), 10);
        assert_eq!(fused, again);
    }

    #[test]
    fn test_limit() {
        let fused = reciprocal_rank_fusion(
            &refs(&[1, 2, 3, 4]),
            &refs(&[5, 6, 7, 8]),
            &FusionConfig::default(),
            3,
        );
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn test_weighted() {
        let config = FusionConfig::new(60.0, 0.3, 0.7).unwrap();
        let fused = reciprocal_rank_fusion(&refs(&[1]), &refs(&[2]), &config, 10);
        assert_eq!(fused[0].id, 2);
    }

    #[test]
    fn test_invalid_config() {
        assert!(FusionConfig::new(60.0, 0.0, 1.0).is_err());
        assert!(FusionConfig::new(0.0, 1.0, 1.0).is_err());
    }

    proptest! {
        // Moving a chunk up in either list never lowers its fused score
        #[test]
        fn prop_rrf_monotonic(
            kw_len in 1usize..20,
            vec_len in 1usize..20,
            kw_pos in 0usize..20,
            vec_pos in 0usize..20,
            steps in 1usize..20,
        ) {
            let kw_pos = kw_pos % kw_len;
            let vec_pos = vec_pos % vec_len;
            let target: ChunkId = 10_000;

            let build = |len: usize, pos: usize, offset: ChunkId| -> Vec<CandidateRef> {
                (0..len)
                    .map(|i| {
                        let id = if i == pos { target } else { offset + i as ChunkId };
                        CandidateRef::new(id, 1.0)
                    })
                    .collect()
            };
            let score_of = |kw: &[CandidateRef], v: &[CandidateRef]| -> f32 {
                reciprocal_rank_fusion(kw, v, &FusionConfig::default(), usize::MAX)
                    .into_iter()
                    .find(|h| h.id == target)
                    .map(|h| h.fused_score)
                    .unwrap_or(0.0)
            };

            let keyword = build(kw_len, kw_pos, 0);
            let vector = build(vec_len, vec_pos, 1_000);
            let base = score_of(&keyword, &vector);

            let better_kw = build(kw_len, kw_pos.saturating_sub(steps), 0);
            let better_vec = build(vec_len, vec_pos.saturating_sub(steps), 1_000);

            prop_assert!(score_of(&better_kw, &vector) >= base);
            prop_assert!(score_of(&keyword, &better_vec) >= base);
        }
    }
}
