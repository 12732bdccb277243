//! Noise penalty and per-source trust weighting
//!
//! OCR debris, tables of symbols and repeated boilerplate tend to match
//! queries lexically while carrying little evidence. The filter never drops a
//! candidate; it lowers the score and records why.

use crate::config::QualityConfig;
use crate::retrieval::{QualityBreakdown, ScoredCandidate};

const MAX_NON_ALNUM_PENALTY: f32 = 0.4;
const MAX_REPETITION_PENALTY: f32 = 0.3;
const MAX_SHORT_TOKEN_PENALTY: f32 = 0.3;
const SHORT_TOKEN_FACTOR: f32 = 0.5;
const SHORT_TOKEN_CHARS: usize = 2;
const MAX_SOURCE_WEIGHT: f32 = 2.0;

/// Scores chunk text quality and applies the adjusted score
pub struct QualityFilter {
    penalty_weight: f32,
    /// Lowercased keys for the substring fallback, in a stable order
    source_weights: Vec<(String, String, f32)>,
}

impl QualityFilter {
    pub fn new(config: &QualityConfig) -> Self {
        let mut source_weights: Vec<(String, String, f32)> = config
            .source_weights
            .iter()
            .map(|(k, w)| (k.clone(), k.to_lowercase(), w.clamp(0.0, MAX_SOURCE_WEIGHT)))
            .collect();
        // Longest key first so the most specific substring wins
        source_weights.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            penalty_weight: config.penalty_weight,
            source_weights,
        }
    }

    /// Noise heuristics for a piece of text
    pub fn assess(text: &str) -> QualityBreakdown {
        let total_chars = text.chars().count();
        if total_chars == 0 {
            return QualityBreakdown {
                non_alphanumeric_ratio: 1.0,
                repetition_ratio: 0.0,
                short_token_ratio: 0.0,
                noise_ratio: MAX_NON_ALNUM_PENALTY,
            };
        }

        let clean_chars = text
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .count();
        let non_alphanumeric_ratio = 1.0 - clean_chars as f32 / total_chars as f32;

        let tokens: Vec<String> = text.split_whitespace().map(|t| t.to_lowercase()).collect();

        // Consecutive identical tokens ("the the the", "---- ----")
        let repetition_ratio = if tokens.len() > 1 {
            let repeats = tokens.windows(2).filter(|w| w[0] == w[1]).count();
            repeats as f32 / (tokens.len() - 1) as f32
        } else {
            0.0
        };

        let short_token_ratio = if tokens.is_empty() {
            0.0
        } else {
            let short = tokens
                .iter()
                .filter(|t| t.chars().count() <= SHORT_TOKEN_CHARS)
                .count();
            short as f32 / tokens.len() as f32
        };

        let noise_ratio = non_alphanumeric_ratio.min(MAX_NON_ALNUM_PENALTY)
            + repetition_ratio.min(MAX_REPETITION_PENALTY)
            + (short_token_ratio * SHORT_TOKEN_FACTOR).min(MAX_SHORT_TOKEN_PENALTY);

        QualityBreakdown {
            non_alphanumeric_ratio,
            repetition_ratio,
            short_token_ratio,
            noise_ratio: noise_ratio.clamp(0.0, 1.0),
        }
    }

    /// Trust multiplier for a source file: exact name first, then substring
    pub fn source_weight(&self, source_file: &str) -> f32 {
        if let Some((_, _, w)) = self.source_weights.iter().find(|(k, _, _)| k == source_file) {
            return *w;
        }
        let lowered = source_file.to_lowercase();
        self.source_weights
            .iter()
            .find(|(_, key, _)| lowered.contains(key.as_str()))
            .map(|(_, _, w)| *w)
            .unwrap_or(1.0)
    }

    /// Adjust every candidate in place and re-sort by adjusted score
    ///
    /// Candidates are never removed.
    pub fn apply(&self, candidates: &mut Vec<ScoredCandidate>) {
        let mut penalized = 0usize;
        for candidate in candidates.iter_mut() {
            let breakdown = Self::assess(&candidate.chunk.text);
            let penalty = self.penalty_weight * breakdown.noise_ratio;
            let weight = self.source_weight(&candidate.chunk.source_file);
            if penalty > 0.0 || weight != 1.0 {
                penalized += 1;
            }
            candidate.apply_quality(breakdown, penalty, weight);
        }

        crate::retrieval::sort_by_final_score(candidates);
        tracing::debug!(
            "Quality filter adjusted {} of {} candidates",
            penalized,
            candidates.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Chunk;
    use std::collections::HashMap;

    fn candidate(id: u64, text: &str, source: &str, fused: f32) -> ScoredCandidate {
        ScoredCandidate::fused(Chunk::new(id, text, vec![], source, 1, 0), fused)
    }

    #[test]
    fn test_clean_text_has_low_noise() {
        let q = QualityFilter::assess("Rama was the eldest son of King Dasharatha of Ayodhya.");
        assert!(q.non_alphanumeric_ratio < 0.05);
        assert_eq!(q.repetition_ratio, 0.0);
        assert!(q.noise_ratio < 0.15);
    }

    #[test]
    fn test_symbol_heavy_text_is_noisy() {
        let q = QualityFilter::assess("|| ## @@ %% ^^ ** ~~ ==> <<< >>> ;; :: ||| a");
        assert!(q.non_alphanumeric_ratio > 0.6);
        assert!(q.noise_ratio >= 0.4);
    }

    #[test]
    fn test_repetition() {
        let q = QualityFilter::assess("page page page page page");
        assert!((q.repetition_ratio - 1.0).abs() < 1e-6);
        assert!(q.noise_ratio >= 0.3);
    }

    #[test]
    fn test_empty_text() {
        let q = QualityFilter::assess("");
        assert_eq!(q.non_alphanumeric_ratio, 1.0);
    }

    #[test]
    fn test_source_weight_matching() {
        let mut weights = HashMap::new();
        weights.insert("scan".to_string(), 0.5);
        weights.insert("scanned_appendix.pdf".to_string(), 0.2);
        weights.insert("Gold".to_string(), 5.0);
        let filter = QualityFilter::new(&QualityConfig {
            penalty_weight: 0.15,
            source_weights: weights,
        });

        assert_eq!(filter.source_weight("scanned_appendix.pdf"), 0.2);
        assert_eq!(filter.source_weight("Old_SCAN_03.pdf"), 0.5);
        assert_eq!(filter.source_weight("gold_standard.pdf"), 2.0);
        assert_eq!(filter.source_weight("clean.pdf"), 1.0);
    }

    #[test]
    fn test_noisy_candidate_drops_below_clean_one() {
        let filter = QualityFilter::new(&QualityConfig::default());
        // Noisy chunk has the better fused score (rank 1 vs rank 2 in RRF)
        let noisy_text: String = "#$%&*@!~^|".repeat(9) + "ab cd ef gh ij";
        let mut candidates = vec![
            candidate(1, &noisy_text, "a.pdf", 1.0 / 61.0),
            candidate(2, "Ravana was the king of Lanka and a devotee of Shiva.", "a.pdf", 1.0 / 62.0),
        ];

        filter.apply(&mut candidates);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id(), 2);
        assert!(candidates[1].quality_penalty > candidates[0].quality_penalty);
        assert!(candidates[1].quality.unwrap().non_alphanumeric_ratio > 0.5);
    }

    #[test]
    fn test_source_weight_scales_fused_score() {
        let mut weights = HashMap::new();
        weights.insert("trusted.pdf".to_string(), 2.0);
        let filter = QualityFilter::new(&QualityConfig {
            penalty_weight: 0.0,
            source_weights: weights,
        });
        let mut candidates = vec![candidate(1, "Some clean sentence here.", "trusted.pdf", 0.02)];
        filter.apply(&mut candidates);
        assert!((candidates[0].adjusted_score - 0.04).abs() < 1e-6);
        assert_eq!(candidates[0].source_weight, 2.0);
    }
}
