//! Cross-encoder reranking of the top fused candidates

use crate::pipeline::{call_blocking, CallFailure, Deadline, Degradation};
use crate::retrieval::{sort_by_final_score, ScoredCandidate};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitializationError(String),

    #[error("Reranking failed: {0}")]
    RerankingError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Reranking service: one relevance score per `(query, text)` pair, in input order
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError>;

    fn model_name(&self) -> &str;
}

fn supported_reranker(name: &str) -> Option<RerankerModel> {
    match name.to_ascii_lowercase().as_str() {
        "bge-reranker-base" | "baai/bge-reranker-base" => Some(RerankerModel::BGERerankerBase),
        "jina-reranker-v1-turbo-en" => Some(RerankerModel::JINARerankerV1TurboEn),
        _ => None,
    }
}

/// Local cross-encoder via FastEmbed
pub struct FastEmbedScorer {
    model: Arc<TextRerank>,
    model_name: String,
}

impl FastEmbedScorer {
    /// Create a new scorer with specified model
    ///
    /// # Arguments
    /// * `model_name` - Model name (e.g., "bge-reranker-base")
    pub fn new(model_name: &str) -> Result<Self, RerankError> {
        let model_kind = supported_reranker(model_name).ok_or_else(|| {
            RerankError::InitializationError(format!("Unsupported reranker model: {}", model_name))
        })?;

        tracing::info!("Initializing reranker model: {}", model_name);

        let init_options = RerankInitOptions::new(model_kind).with_show_download_progress(true);
        let model = TextRerank::try_new(init_options)
            .map_err(|e| RerankError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
        })
    }

    pub fn with_default_model() -> Result<Self, RerankError> {
        Self::new("bge-reranker-base")
    }
}

impl RelevanceScorer for FastEmbedScorer {
    fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if query.is_empty() {
            return Err(RerankError::InvalidInput("Query cannot be empty".to_string()));
        }

        let documents: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        let results = self
            .model
            .rerank(query, documents, false, None)
            .map_err(|e| RerankError::RerankingError(e.to_string()))?;

        // fastembed returns results sorted by score; put them back in input order
        let mut scores = vec![f32::NEG_INFINITY; texts.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(RerankError::RerankingError(
                "Reranker did not score every document".to_string(),
            ));
        }
        Ok(scores)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Reranked pool, plus what went wrong if the scorer could not be used
pub struct RerankOutcome {
    pub candidates: Vec<ScoredCandidate>,
    pub degradation: Option<Degradation>,
}

/// Re-scores the top `top_n` candidates with a [`RelevanceScorer`]
///
/// On success the pool becomes the reranked top `top_n`, sorted by rerank
/// score. On error or timeout the input is returned unchanged and the failure
/// is reported as a degradation, never as an error.
pub struct RelevanceReranker {
    scorer: Arc<dyn RelevanceScorer>,
    top_n: usize,
    timeout: Duration,
}

impl RelevanceReranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>, top_n: usize, timeout: Duration) -> Self {
        Self {
            scorer,
            top_n,
            timeout,
        }
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredCandidate>,
        deadline: &Deadline,
    ) -> RerankOutcome {
        if candidates.len() < 2 || self.top_n == 0 {
            return RerankOutcome {
                candidates,
                degradation: None,
            };
        }

        let n = self.top_n.min(candidates.len());
        let texts: Vec<String> = candidates[..n].iter().map(|c| c.chunk.text.clone()).collect();
        let scorer = Arc::clone(&self.scorer);
        let owned_query = query.to_string();

        let result = call_blocking(deadline.bound(self.timeout), move || {
            scorer.score(&owned_query, &texts)
        })
        .await;

        let scores = match result {
            Ok(Ok(scores)) if scores.len() == n => scores,
            Ok(Ok(scores)) => {
                let message = format!("expected {} scores, got {}", n, scores.len());
                tracing::warn!("Reranker returned a malformed batch: {}", message);
                return RerankOutcome {
                    candidates,
                    degradation: Some(Degradation::RerankFailed { message }),
                };
            }
            Ok(Err(e)) => {
                tracing::warn!("Reranking failed, keeping fused order: {}", e);
                return RerankOutcome {
                    candidates,
                    degradation: Some(Degradation::RerankFailed {
                        message: e.to_string(),
                    }),
                };
            }
            Err(CallFailure::TimedOut) => {
                tracing::warn!("Reranker timed out, keeping fused order");
                return RerankOutcome {
                    candidates,
                    degradation: Some(Degradation::RerankTimedOut),
                };
            }
            Err(failure) => {
                tracing::warn!("Reranker worker failed, keeping fused order: {}", failure);
                return RerankOutcome {
                    candidates,
                    degradation: Some(Degradation::RerankFailed {
                        message: failure.to_string(),
                    }),
                };
            }
        };

        let mut reranked: Vec<ScoredCandidate> = candidates.into_iter().take(n).collect();
        for (candidate, score) in reranked.iter_mut().zip(scores) {
            candidate.apply_rerank(score);
        }
        sort_by_final_score(&mut reranked);

        tracing::debug!("Reranked {} candidates with {}", n, self.scorer.model_name());
        RerankOutcome {
            candidates: reranked,
            degradation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Chunk;

    /// Scores by text length, longest first
    struct LengthScorer;

    impl RelevanceScorer for LengthScorer {
        fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError> {
            Ok(texts.iter().map(|t| t.len() as f32).collect())
        }

        fn model_name(&self) -> &str {
            "length"
        }
    }

    struct FailingScorer;

    impl RelevanceScorer for FailingScorer {
        fn score(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>, RerankError> {
            Err(RerankError::RerankingError("service down".to_string()))
        }

        fn model_name(&self) -> &str {
            "failing"
        }
    }

    struct SlowScorer;

    impl RelevanceScorer for SlowScorer {
        fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![1.0; texts.len()])
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    fn pool() -> Vec<ScoredCandidate> {
        vec![
            ScoredCandidate::fused(Chunk::new(1, "short", vec![], "a.pdf", 1, 0), 0.03),
            ScoredCandidate::fused(Chunk::new(2, "a much longer passage", vec![], "a.pdf", 2, 0), 0.02),
            ScoredCandidate::fused(Chunk::new(3, "medium text", vec![], "a.pdf", 3, 0), 0.01),
        ]
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_rerank_reorders_top_n_and_drops_tail() {
        let reranker = RelevanceReranker::new(Arc::new(LengthScorer), 2, Duration::from_secs(1));
        let outcome = reranker.rerank("query", pool(), &deadline()).await;

        assert!(outcome.degradation.is_none());
        let ids: Vec<u64> = outcome.candidates.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(outcome.candidates[0].rerank_score, Some(21.0));
        assert_eq!(outcome.candidates[0].final_score, 21.0);
    }

    #[tokio::test]
    async fn test_rerank_error_degrades_silently() {
        let reranker = RelevanceReranker::new(Arc::new(FailingScorer), 20, Duration::from_secs(1));
        let outcome = reranker.rerank("query", pool(), &deadline()).await;

        assert!(matches!(outcome.degradation, Some(Degradation::RerankFailed { .. })));
        assert_eq!(outcome.candidates.len(), 3);
        assert!(outcome.candidates.iter().all(|c| c.rerank_score.is_none()));
        assert_eq!(outcome.candidates[0].id(), 1);
    }

    #[tokio::test]
    async fn test_rerank_timeout_degrades_silently() {
        let reranker = RelevanceReranker::new(Arc::new(SlowScorer), 20, Duration::from_millis(20));
        let outcome = reranker.rerank("query", pool(), &deadline()).await;

        assert_eq!(outcome.degradation, Some(Degradation::RerankTimedOut));
        assert!(outcome.candidates.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_single_candidate_is_not_sent() {
        let reranker = RelevanceReranker::new(Arc::new(FailingScorer), 20, Duration::from_secs(1));
        let single: Vec<ScoredCandidate> = pool().into_iter().take(1).collect();
        let outcome = reranker.rerank("query", single, &deadline()).await;
        assert!(outcome.degradation.is_none());
        assert_eq!(outcome.candidates.len(), 1);
    }

    #[test]
    fn test_supported_reranker_lookup() {
        assert!(supported_reranker("BGE-Reranker-Base").is_some());
        assert!(supported_reranker("unknown-model").is_none());
    }

    #[test]
    #[ignore] // Requires model download
    fn test_fastembed_scorer_orders_relevant_text_first() {
        let scorer = FastEmbedScorer::with_default_model().unwrap();
        let texts = vec![
            "Paris is the capital of France.".to_string(),
            "The weather is nice today.".to_string(),
        ];
        let scores = scorer.score("What is the capital of France?", &texts).unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
    }
}
