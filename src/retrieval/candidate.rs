//! Per-query candidate with its score breakdown

use crate::storage::{Chunk, ChunkId};
use serde::{Deserialize, Serialize};

/// How far a candidate's score has been derived
///
/// `final_score` is always derived in this order; a stage setter called out
/// of order is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStage {
    Fused,
    QualityAdjusted,
    Reranked,
    Diversified,
}

/// Noise heuristics computed by the quality filter
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub non_alphanumeric_ratio: f32,
    pub repetition_ratio: f32,
    pub short_token_ratio: f32,
    /// Combined noise in [0, 1]
    pub noise_ratio: f32,
}

/// A chunk annotated with everything the pipeline computed for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub chunk: Chunk,
    /// Zero-based position in the vector backend's list
    pub vector_rank: Option<usize>,
    pub vector_score: Option<f32>,
    /// Zero-based position in the keyword backend's list
    pub keyword_rank: Option<usize>,
    pub keyword_score: Option<f32>,
    pub fused_score: f32,
    pub quality: Option<QualityBreakdown>,
    pub quality_penalty: f32,
    pub source_weight: f32,
    pub adjusted_score: f32,
    pub rerank_score: Option<f32>,
    pub diversity_penalty: f32,
    pub final_score: f32,
    /// 1-based position in the returned bundle; 0 until assigned
    pub rank: usize,
    /// Sub-query order indices this chunk was retrieved by (empty when not decomposed)
    pub origins: Vec<usize>,
    pub stage: ScoreStage,
}

impl ScoredCandidate {
    /// Candidate fresh out of rank fusion
    pub fn fused(chunk: Chunk, fused_score: f32) -> Self {
        Self {
            chunk,
            vector_rank: None,
            vector_score: None,
            keyword_rank: None,
            keyword_score: None,
            fused_score,
            quality: None,
            quality_penalty: 0.0,
            source_weight: 1.0,
            adjusted_score: fused_score,
            rerank_score: None,
            diversity_penalty: 0.0,
            final_score: fused_score,
            rank: 0,
            origins: Vec::new(),
            stage: ScoreStage::Fused,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.chunk.id
    }

    /// Score diversity ranking treats as relevance: rerank score when present,
    /// otherwise the quality-adjusted fused score
    pub fn relevance(&self) -> f32 {
        self.rerank_score.unwrap_or(self.adjusted_score)
    }

    /// `adjusted = fused * source_weight - penalty`
    pub fn apply_quality(&mut self, breakdown: QualityBreakdown, penalty: f32, source_weight: f32) {
        if self.stage > ScoreStage::Fused {
            tracing::warn!("Ignoring out-of-order quality adjustment for chunk {}", self.id());
            return;
        }
        self.quality = Some(breakdown);
        self.quality_penalty = penalty;
        self.source_weight = source_weight;
        self.adjusted_score = self.fused_score * source_weight - penalty;
        self.final_score = self.adjusted_score;
        self.stage = ScoreStage::QualityAdjusted;
    }

    /// Rerank score overrides the adjusted score
    pub fn apply_rerank(&mut self, score: f32) {
        if self.stage > ScoreStage::Reranked {
            tracing::warn!("Ignoring out-of-order rerank for chunk {}", self.id());
            return;
        }
        self.rerank_score = Some(score);
        self.final_score = score;
        self.stage = ScoreStage::Reranked;
    }

    /// Final MMR score and the penalty that went into it
    pub fn apply_diversity(&mut self, penalty: f32, mmr_score: f32) {
        if self.stage == ScoreStage::Diversified {
            tracing::warn!("Ignoring repeated diversity pass for chunk {}", self.id());
            return;
        }
        self.diversity_penalty = penalty;
        self.final_score = mmr_score;
        self.stage = ScoreStage::Diversified;
    }

    /// Undo the diversity stage so a merged pool can be diversified again
    pub fn reopen_for_merge(&mut self) {
        if self.stage != ScoreStage::Diversified {
            return;
        }
        self.diversity_penalty = 0.0;
        self.final_score = self.relevance();
        self.stage = if self.rerank_score.is_some() {
            ScoreStage::Reranked
        } else if self.quality.is_some() {
            ScoreStage::QualityAdjusted
        } else {
            ScoreStage::Fused
        };
    }

    /// Short preview of the chunk text, cut on a char boundary
    pub fn preview(&self, max_chars: usize) -> String {
        let text = &self.chunk.text;
        match text.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", &text[..idx]),
            None => text.clone(),
        }
    }
}

/// Sort by `final_score` descending, keeping the existing order on ties
pub fn sort_by_final_score(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Assign 1-based ranks in current order
pub fn assign_ranks(candidates: &mut [ScoredCandidate]) {
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = i + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(score: f32) -> ScoredCandidate {
        ScoredCandidate::fused(Chunk::new(1, "Rama went to the forest.", vec![], "a.pdf", 1, 0), score)
    }

    #[test]
    fn test_stage_order() {
        let mut c = candidate(0.03);
        c.apply_quality(QualityBreakdown::default(), 0.01, 2.0);
        assert!((c.adjusted_score - 0.05).abs() < 1e-6);
        assert_eq!(c.final_score, c.adjusted_score);

        c.apply_rerank(4.2);
        assert_eq!(c.relevance(), 4.2);
        assert_eq!(c.final_score, 4.2);

        c.apply_diversity(0.1, 0.6);
        assert_eq!(c.final_score, 0.6);

        // Out of order: ignored
        c.apply_quality(QualityBreakdown::default(), 0.5, 1.0);
        assert!((c.adjusted_score - 0.05).abs() < 1e-6);
        c.apply_rerank(-1.0);
        assert_eq!(c.rerank_score, Some(4.2));
    }

    #[test]
    fn test_reopen_for_merge() {
        let mut c = candidate(0.03);
        c.apply_quality(QualityBreakdown::default(), 0.0, 1.0);
        c.apply_diversity(0.2, 0.5);
        c.reopen_for_merge();
        assert_eq!(c.stage, ScoreStage::QualityAdjusted);
        assert_eq!(c.final_score, 0.03);
        assert_eq!(c.diversity_penalty, 0.0);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut a = candidate(0.5);
        a.chunk.id = 1;
        let mut b = candidate(0.5);
        b.chunk.id = 2;
        let mut c = candidate(0.9);
        c.chunk.id = 3;
        let mut list = vec![a, b, c];
        sort_by_final_score(&mut list);
        assign_ranks(&mut list);
        assert_eq!(list.iter().map(|c| c.id()).collect::<Vec<_>>(), vec![3, 1, 2]);
        assert_eq!(list[2].rank, 3);
    }

    #[test]
    fn test_preview() {
        let c = candidate(0.1);
        assert_eq!(c.preview(4), "Rama...");
        assert_eq!(c.preview(100), "Rama went to the forest.");
    }
}
