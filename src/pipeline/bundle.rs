//! Pipeline output: the result bundle, its routing metadata and the debug view

use crate::evidence::{CompressionStats, EvidenceSentence, SentenceScoring};
use crate::retrieval::{DiversityStats, QualityBreakdown, ScoredCandidate};
use crate::routing::{Complexity, QueryType, Route, Strategy, SubQuery};
use crate::storage::ChunkId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SUMMARY_PREVIEW_CHARS: usize = 200;
const SUMMARY_CANDIDATES: usize = 3;

/// Pipeline step, as reported in deadline degradations and timings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Routing,
    Retrieval,
    Rerank,
    Diversity,
    Evidence,
    Compression,
    Merge,
}

/// Something that went wrong but did not stop the query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    KeywordBackendUnavailable { message: String },
    VectorBackendUnavailable { message: String },
    EmbeddingUnavailable { message: String },
    RerankFailed { message: String },
    RerankTimedOut,
    ClassifierFailed { message: String },
    DecompositionFailed { message: String },
    SubQueryFailed { order: usize, message: String },
    EvidenceScoringFallback,
    DeadlineExceeded { stage: PipelineStage },
}

/// How the query was handled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub query_type: QueryType,
    pub confidence: f32,
    pub complexity: Complexity,
    pub route: Route,
    pub strategy: Strategy,
    /// Text actually retrieved with, after session resolution
    pub resolved_query: String,
    pub expanded_from_session: bool,
    pub decomposed: bool,
    pub sub_queries: Vec<SubQuery>,
    /// `final_chars / original_chars` of the evidence; 1.0 when untouched
    pub compression_ratio: f32,
    pub compression: Option<CompressionStats>,
    pub diversity: Option<DiversityStats>,
    pub evidence_scoring: Option<SentenceScoring>,
    pub degradations: Vec<Degradation>,
}

/// Where a piece of evidence came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCitation {
    pub chunk_id: ChunkId,
    pub source_file: String,
    pub page: u32,
}

/// Ranked evidence handed to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub id: Uuid,
    pub query: String,
    pub created_at: DateTime<Utc>,
    /// Ranked 1..n, each with at least one evidence sentence
    pub candidates: Vec<ScoredCandidate>,
    /// Grouped by candidate rank, then by position within the chunk
    pub evidence: Vec<EvidenceSentence>,
    pub total_chars: usize,
    pub routing: RoutingMetadata,
}

impl ResultBundle {
    pub fn is_degraded(&self) -> bool {
        !self.routing.degradations.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// One citation per candidate, in rank order
    pub fn citations(&self) -> Vec<SourceCitation> {
        self.candidates
            .iter()
            .map(|c| SourceCitation {
                chunk_id: c.id(),
                source_file: c.chunk.source_file.clone(),
                page: c.chunk.page,
            })
            .collect()
    }

    /// Evidence for one candidate, in chunk order
    pub fn evidence_for(&self, chunk_id: ChunkId) -> impl Iterator<Item = &EvidenceSentence> {
        self.evidence.iter().filter(move |s| s.chunk_id == chunk_id)
    }

    /// Short text remembered as the result of a conversation turn
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .candidates
            .iter()
            .take(SUMMARY_CANDIDATES)
            .filter_map(|c| self.evidence_for(c.id()).next())
            .map(|s| s.text.clone())
            .collect();
        if parts.is_empty() {
            parts = self
                .candidates
                .iter()
                .take(SUMMARY_CANDIDATES)
                .map(|c| c.preview(SUMMARY_PREVIEW_CHARS))
                .collect();
        }
        parts.join(" ")
    }
}

/// Every score component of one candidate seen by fusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTrace {
    pub chunk_id: ChunkId,
    pub source_file: String,
    pub page: u32,
    pub vector_rank: Option<usize>,
    pub vector_score: Option<f32>,
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
    /// Rank in the bundle when it survived
    pub rank: Option<usize>,
    pub survived: bool,
}

impl CandidateTrace {
    pub fn from_candidate(candidate: &ScoredCandidate) -> Self {
        Self {
            chunk_id: candidate.id(),
            source_file: candidate.chunk.source_file.clone(),
            page: candidate.chunk.page,
            vector_rank: candidate.vector_rank,
            vector_score: candidate.vector_score,
            keyword_rank: candidate.keyword_rank,
            keyword_score: candidate.keyword_score,
            fused_score: candidate.fused_score,
            quality: candidate.quality,
            quality_penalty: candidate.quality_penalty,
            source_weight: candidate.source_weight,
            adjusted_score: candidate.adjusted_score,
            rerank_score: candidate.rerank_score,
            diversity_penalty: candidate.diversity_penalty,
            final_score: candidate.final_score,
            rank: None,
            survived: false,
        }
    }
}

/// Per-stage timing in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: PipelineStage,
    pub millis: u64,
}

/// Retrieval internals, produced only when the request asks for them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugView {
    /// In fused order; later stages update the score fields of survivors
    pub candidates: Vec<CandidateTrace>,
    pub timings: Vec<StageTiming>,
}

/// What [`crate::pipeline::Pipeline::search`] returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub bundle: ResultBundle,
    pub from_cache: bool,
    /// `None` for cache hits, which run no stage
    pub debug: Option<DebugView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degradation_serializes_with_kind_tag() {
        let value = serde_json::to_value(Degradation::DeadlineExceeded {
            stage: PipelineStage::Rerank,
        })
        .unwrap();
        assert_eq!(value["kind"], "deadline_exceeded");
        assert_eq!(value["stage"], "rerank");

        let value = serde_json::to_value(Degradation::RerankTimedOut).unwrap();
        assert_eq!(value["kind"], "rerank_timed_out");
    }
}
