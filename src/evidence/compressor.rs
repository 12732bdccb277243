//! Character-budget enforcement over evidence sentences
//!
//! Lowest-scored sentences go first. When dropping a whole sentence would
//! overshoot the budget, it is cut at a clause or word break that keeps at
//! least `compression_threshold` of the room left for it. The last sentence of
//! a source is kept while the bundle holds no more than `min_sources` distinct
//! source files, even if that leaves the bundle over budget.

use crate::config::CompressionConfig;
use crate::evidence::{cut_point, total_chars, EvidenceSentence};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Outcome of one compression pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub budget: usize,
    pub original_chars: usize,
    pub final_chars: usize,
    pub sentences_kept: usize,
    pub sentences_dropped: usize,
    pub truncated: bool,
    /// Over budget to keep the minimum number of sources
    pub over_budget: bool,
    /// `final_chars / original_chars`; 1.0 when nothing was removed
    pub ratio: f32,
}

pub struct ContextCompressor {
    min_sources: usize,
    threshold: f32,
}

impl ContextCompressor {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            min_sources: config.min_sources,
            threshold: config.compression_threshold.clamp(0.0, 1.0),
        }
    }

    /// Trim `sentences` to `budget` characters, keeping their order
    pub fn compress(
        &self,
        sentences: Vec<EvidenceSentence>,
        budget: usize,
    ) -> (Vec<EvidenceSentence>, CompressionStats) {
        let original_chars = total_chars(&sentences);
        let mut stats = CompressionStats {
            budget,
            original_chars,
            ..Default::default()
        };

        if original_chars <= budget {
            stats.final_chars = original_chars;
            stats.sentences_kept = sentences.len();
            stats.ratio = 1.0;
            return (sentences, stats);
        }

        let mut slots: Vec<Option<EvidenceSentence>> = sentences.into_iter().map(Some).collect();
        let mut total = original_chars;

        let mut per_source: AHashMap<String, usize> = AHashMap::new();
        for s in slots.iter().flatten() {
            *per_source.entry(s.source_file.clone()).or_insert(0) += 1;
        }

        // Lowest score first; among equals, the later sentence goes first
        let mut priority: Vec<usize> = (0..slots.len()).collect();
        priority.sort_by(|&a, &b| {
            let (sa, sb) = (score_of(&slots[a]), score_of(&slots[b]));
            sa.partial_cmp(&sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.cmp(&a))
        });

        for idx in priority {
            if total <= budget {
                break;
            }
            let Some((len, source)) = slots[idx].as_ref().map(|s| (s.char_len(), s.source_file.clone())) else {
                continue;
            };
            let others = total - len;

            // Dropping it would leave room to spare: try to keep a cut of it instead
            if others < budget {
                let room = budget - others;
                let min_keep = ((room as f32 * self.threshold).ceil() as usize).max(1);
                if let Some(s) = slots[idx].as_mut() {
                    if let Some(cut) = cut_point(&s.text, min_keep, room) {
                        s.text = s.text[..cut].trim_end().to_string();
                        s.truncated = true;
                        total = others + s.char_len();
                        stats.truncated = true;
                        continue;
                    }
                }
            }

            let source_count = per_source.get(&source).copied().unwrap_or(0);
            let protected = source_count == 1 && per_source.len() <= self.min_sources;
            if protected {
                continue;
            }

            slots[idx] = None;
            total = others;
            stats.sentences_dropped += 1;
            match per_source.get_mut(&source) {
                Some(count) if *count > 1 => *count -= 1,
                _ => {
                    per_source.remove(&source);
                }
            }
        }

        let kept: Vec<EvidenceSentence> = slots.into_iter().flatten().collect();
        stats.final_chars = total_chars(&kept);
        stats.sentences_kept = kept.len();
        stats.over_budget = stats.final_chars > budget;
        stats.ratio = if original_chars == 0 {
            1.0
        } else {
            stats.final_chars as f32 / original_chars as f32
        };

        if stats.over_budget {
            tracing::info!(
                "Evidence kept at {} chars over a {} budget to preserve {} sources",
                stats.final_chars,
                budget,
                per_source.len()
            );
        }
        tracing::debug!(
            "Compressed evidence {} -> {} chars ({} sentences dropped)",
            original_chars,
            stats.final_chars,
            stats.sentences_dropped
        );
        (kept, stats)
    }
}

fn score_of(slot: &Option<EvidenceSentence>) -> f32 {
    slot.as_ref().map_or(f32::INFINITY, |s| s.score)
}
