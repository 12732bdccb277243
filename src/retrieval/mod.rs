//! Candidate retrieval and ranking
//!
//! Stages run in a fixed order for every query:
//!
//! 1. keyword + vector search, fused with Reciprocal Rank Fusion ([`HybridSearcher`])
//! 2. noise penalty and source trust ([`QualityFilter`])
//! 3. optional cross-encoder rerank of the top-N ([`RelevanceReranker`])
//! 4. page dedup + MMR ([`DiversityRanker`])
//!
//! Decomposed queries run 1-4 per sub-query and are merged with
//! [`merge_subquery_results`] before a second diversity pass.

mod candidate;
mod deduplication;
mod diversity;
mod fusion;
mod hybrid;
mod quality;
mod reranker;

pub use candidate::{assign_ranks, sort_by_final_score, QualityBreakdown, ScoreStage, ScoredCandidate};
pub use deduplication::{merge_subquery_results, MergedResults};
pub use diversity::{DiversityRanker, DiversityStats};
pub use fusion::{reciprocal_rank_fusion, FusedHit, FusionConfig, FusionError};
pub use hybrid::{HybridSearcher, RetrievalOutcome};
pub use quality::QualityFilter;
pub use reranker::{FastEmbedScorer, RelevanceReranker, RelevanceScorer, RerankError, RerankOutcome};
