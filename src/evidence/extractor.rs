//! Sentence selection against the query

use crate::config::EvidenceConfig;
use crate::embedding::{cosine_similarity, token_overlap, EmbeddingProvider};
use crate::evidence::{EvidenceSentence, SentenceSplitter};
use crate::pipeline::{call_blocking, Deadline, Degradation};
use crate::retrieval::ScoredCandidate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const FALLBACK_SENTENCES: usize = 2;

/// How sentence scores were computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentenceScoring {
    Embedding,
    Lexical,
}

#[derive(Debug)]
pub struct EvidenceOutcome {
    /// Grouped by candidate (input order), then by position within the chunk
    pub sentences: Vec<EvidenceSentence>,
    pub scoring: SentenceScoring,
    pub degradation: Option<Degradation>,
}

pub struct EvidenceExtractor {
    config: EvidenceConfig,
    splitter: SentenceSplitter,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    timeout: Duration,
}

impl EvidenceExtractor {
    pub fn new(config: &EvidenceConfig, embedder: Option<Arc<dyn EmbeddingProvider>>, timeout: Duration) -> Self {
        Self {
            config: config.clone(),
            splitter: SentenceSplitter::new(config),
            embedder,
            timeout,
        }
    }

    /// Select evidence for every candidate
    ///
    /// Sentences are scored by cosine similarity to `query_embedding` when the
    /// embedding service can embed them in time, otherwise by token overlap
    /// with `query`.
    pub async fn extract(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        candidates: &[ScoredCandidate],
        deadline: &Deadline,
    ) -> EvidenceOutcome {
        let split: Vec<Vec<String>> = candidates
            .iter()
            .map(|c| self.splitter.split(&c.chunk.text))
            .collect();

        let (scores, scoring, degradation) = match (&self.embedder, query_embedding) {
            (Some(embedder), Some(query_vec)) => {
                match self.embed_scores(embedder, query_vec, &split, deadline).await {
                    Ok(scores) => (scores, SentenceScoring::Embedding, None),
                    Err(message) => {
                        tracing::warn!("Sentence embedding failed, scoring lexically: {}", message);
                        (
                            lexical_scores(query, &split),
                            SentenceScoring::Lexical,
                            Some(Degradation::EvidenceScoringFallback),
                        )
                    }
                }
            }
            (Some(_), None) => (
                lexical_scores(query, &split),
                SentenceScoring::Lexical,
                Some(Degradation::EvidenceScoringFallback),
            ),
            (None, _) => (lexical_scores(query, &split), SentenceScoring::Lexical, None),
        };

        EvidenceOutcome {
            sentences: self.select(candidates, &split, &scores),
            scoring,
            degradation,
        }
    }

    /// Every sentence of every candidate, scored by the candidate's standing
    ///
    /// Used when extraction is switched off so the compressor still has
    /// sentence-sized units to work with.
    pub fn passthrough(&self, candidates: &[ScoredCandidate]) -> Vec<EvidenceSentence> {
        candidates
            .iter()
            .flat_map(|candidate| {
                self.splitter
                    .split(&candidate.chunk.text)
                    .into_iter()
                    .enumerate()
                    .map(move |(position, text)| evidence(candidate, text, candidate.final_score, position, false))
            })
            .collect()
    }

    /// Per-chunk cap, bundle-wide cap and threshold, then fallbacks
    pub fn select(
        &self,
        candidates: &[ScoredCandidate],
        split: &[Vec<String>],
        scores: &[Vec<f32>],
    ) -> Vec<EvidenceSentence> {
        // (candidate index, position, score)
        let mut pool: Vec<(usize, usize, f32)> = Vec::new();
        for (ci, chunk_scores) in scores.iter().enumerate() {
            let mut ranked: Vec<(usize, f32)> = chunk_scores
                .iter()
                .copied()
                .enumerate()
                .filter(|(_, s)| *s >= self.config.similarity_threshold)
                .collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            ranked.truncate(self.config.max_sentences_per_chunk);
            pool.extend(ranked.into_iter().map(|(pos, s)| (ci, pos, s)));
        }

        pool.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        pool.truncate(self.config.max_sentences);

        let mut selected: Vec<EvidenceSentence> = pool
            .into_iter()
            .map(|(ci, pos, score)| evidence(&candidates[ci], split[ci][pos].clone(), score, pos, false))
            .collect();

        // A surviving candidate never ends up without evidence
        for (ci, candidate) in candidates.iter().enumerate() {
            if selected.iter().any(|e| e.chunk_id == candidate.id()) {
                continue;
            }
            if split[ci].is_empty() {
                let text = match candidate.chunk.text.char_indices().nth(self.config.max_sentence_chars) {
                    Some((idx, _)) => format!("{}...", &candidate.chunk.text[..idx]),
                    None => candidate.chunk.text.trim().to_string(),
                };
                if !text.is_empty() {
                    selected.push(evidence(candidate, text, 0.0, 0, true));
                }
                continue;
            }
            for pos in 0..split[ci].len().min(FALLBACK_SENTENCES) {
                let score = scores[ci].get(pos).copied().unwrap_or(0.0);
                selected.push(evidence(candidate, split[ci][pos].clone(), score, pos, true));
            }
        }

        let order: Vec<_> = candidates.iter().map(|c| c.id()).collect();
        selected.sort_by_key(|e| {
            (
                order.iter().position(|id| *id == e.chunk_id).unwrap_or(usize::MAX),
                e.position,
            )
        });
        selected
    }

    async fn embed_scores(
        &self,
        embedder: &Arc<dyn EmbeddingProvider>,
        query_vec: &[f32],
        split: &[Vec<String>],
        deadline: &Deadline,
    ) -> Result<Vec<Vec<f32>>, String> {
        let flat: Vec<String> = split.iter().flatten().cloned().collect();
        if flat.is_empty() {
            return Ok(split.iter().map(|_| Vec::new()).collect());
        }

        let embedder = Arc::clone(embedder);
        let expected = flat.len();
        let vectors = match call_blocking(deadline.bound(self.timeout), move || embedder.embed_batch(&flat)).await {
            Ok(Ok(vectors)) if vectors.len() == expected => vectors,
            Ok(Ok(vectors)) => {
                return Err(format!("expected {} embeddings, got {}", expected, vectors.len()))
            }
            Ok(Err(e)) => return Err(e.to_string()),
            Err(failure) => return Err(format!("sentence embedding {}", failure)),
        };

        let mut vectors = vectors.into_iter();
        Ok(split
            .iter()
            .map(|sentences| {
                sentences
                    .iter()
                    .filter_map(|_| vectors.next())
                    .map(|v| cosine_similarity(query_vec, &v))
                    .collect()
            })
            .collect())
    }
}

fn lexical_scores(query: &str, split: &[Vec<String>]) -> Vec<Vec<f32>> {
    split
        .iter()
        .map(|sentences| sentences.iter().map(|s| token_overlap(query, s)).collect())
        .collect()
}

fn evidence(candidate: &ScoredCandidate, text: String, score: f32, position: usize, fallback: bool) -> EvidenceSentence {
    EvidenceSentence {
        chunk_id: candidate.id(),
        source_file: candidate.chunk.source_file.clone(),
        page: candidate.chunk.page,
        text,
        score,
        position,
        fallback,
        truncated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingError;
    use crate::storage::Chunk;

    /// 2-d vectors: [mentions rama, mentions anything else]
    struct KeywordEmbedder;

    impl EmbeddingProvider for KeywordEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let lower = text.to_lowercase();
            Ok(if lower.contains("rama") { vec![1.0, 0.1] } else { vec![0.0, 1.0] })
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            texts.iter().map(|t| self.embed(t)).collect()
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "keyword"
        }
    }

    struct DownEmbedder;

    impl EmbeddingProvider for DownEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::GenerationError("offline".to_string()))
        }

        fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::GenerationError("offline".to_string()))
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "down"
        }
    }

    fn candidate(id: u64, text: &str) -> ScoredCandidate {
        ScoredCandidate::fused(Chunk::new(id, text, vec![], "ramayana.pdf", id as u32, 0), 0.1)
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_embedding_scoring_picks_relevant_sentences() {
        let extractor = EvidenceExtractor::new(
            &EvidenceConfig::default(),
            Some(Arc::new(KeywordEmbedder)),
            Duration::from_secs(1),
        );
        let candidates = vec![candidate(
            1,
            "The palace had many rooms and gardens. Rama was the eldest son of Dasharatha. \
             Weather in the region is usually hot in summer.",
        )];

        let outcome = extractor
            .extract("Who is Rama?", Some(&[1.0, 0.0]), &candidates, &deadline())
            .await;

        assert_eq!(outcome.scoring, SentenceScoring::Embedding);
        assert!(outcome.degradation.is_none());
        assert_eq!(outcome.sentences.len(), 1);
        assert_eq!(outcome.sentences[0].text, "Rama was the eldest son of Dasharatha.");
        assert_eq!(outcome.sentences[0].position, 1);
        assert!(!outcome.sentences[0].fallback);
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_lexical() {
        let extractor = EvidenceExtractor::new(
            &EvidenceConfig::default(),
            Some(Arc::new(DownEmbedder)),
            Duration::from_secs(1),
        );
        let candidates = vec![candidate(1, "Rama is the hero of the epic. Completely unrelated filler text here.")];

        let outcome = extractor
            .extract("rama hero epic", Some(&[1.0, 0.0]), &candidates, &deadline())
            .await;

        assert_eq!(outcome.scoring, SentenceScoring::Lexical);
        assert_eq!(outcome.degradation, Some(Degradation::EvidenceScoringFallback));
        assert_eq!(outcome.sentences[0].text, "Rama is the hero of the epic.");
    }

    #[tokio::test]
    async fn test_fallback_never_leaves_candidate_empty() {
        let extractor = EvidenceExtractor::new(&EvidenceConfig::default(), None, Duration::from_secs(1));
        let candidates = vec![
            candidate(1, "Sita was born in Mithila to King Janaka. She married Rama later on. Third sentence is here."),
            candidate(2, "short"),
        ];

        let outcome = extractor
            .extract("completely different words", None, &candidates, &deadline())
            .await;

        let first: Vec<&EvidenceSentence> = outcome.sentences.iter().filter(|e| e.chunk_id == 1).collect();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.fallback));
        assert_eq!(first[0].position, 0);

        // No sentence passes the length filter: raw text stands in
        let second: Vec<&EvidenceSentence> = outcome.sentences.iter().filter(|e| e.chunk_id == 2).collect();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].text, "short");
    }

    #[test]
    fn test_bundle_wide_and_per_chunk_caps() {
        let config = EvidenceConfig {
            max_sentences: 3,
            max_sentences_per_chunk: 2,
            similarity_threshold: 0.3,
            ..EvidenceConfig::default()
        };
        let extractor = EvidenceExtractor::new(&config, None, Duration::from_secs(1));
        let candidates = vec![candidate(1, "x"), candidate(2, "y")];
        let split = vec![
            vec!["a1".to_string(), "a2".to_string(), "a3".to_string()],
            vec!["b1".to_string(), "b2".to_string()],
        ];
        let scores = vec![vec![0.9, 0.8, 0.85], vec![0.7, 0.2]];

        let selected = extractor.select(&candidates, &split, &scores);
        let texts: Vec<&str> = selected.iter().map(|e| e.text.as_str()).collect();
        // Chunk 1 capped at its top two (a1, a3); b1 fills the bundle-wide third slot
        assert_eq!(texts, vec!["a1", "a3", "b1"]);
    }
}
