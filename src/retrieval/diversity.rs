//! Page deduplication and Maximal Marginal Relevance selection
//!
//! Runs in two passes over a relevance-sorted pool:
//!
//! 1. cap the number of candidates per `(source_file, page)`
//! 2. pick candidates one at a time maximising
//!    `lambda * relevance - (1 - lambda) * max_sim(selected)`
//!
//! Relevance is min-max normalised over the pool so it is comparable with
//! cosine similarity whatever the upstream score scale (RRF, cross-encoder).
//! Candidates closer than the similarity threshold to something already chosen
//! carry an extra penalty of `1 - lambda` but stay eligible.

use crate::config::DiversityConfig;
use crate::embedding::{cosine_similarity, token_overlap};
use crate::retrieval::{sort_by_final_score, ScoredCandidate};
use crate::storage::ChunkId;
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

/// What the diversity pass did to one pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiversityStats {
    pub pool_size: usize,
    pub page_duplicates_removed: usize,
    /// Selections made while above the near-duplicate threshold
    pub near_duplicates_penalised: usize,
    pub selected: usize,
    /// Mean pairwise similarity of the top-k by relevance minus that of the selection
    pub diversity_gain: f32,
}

pub struct DiversityRanker {
    lambda: f32,
    similarity_threshold: f32,
    max_chunks_per_page: usize,
}

impl DiversityRanker {
    pub fn new(config: &DiversityConfig) -> Self {
        Self {
            lambda: config.mmr_lambda.clamp(0.0, 1.0),
            similarity_threshold: config.mmr_similarity_threshold,
            max_chunks_per_page: config.max_chunks_per_page.max(1),
        }
    }

    /// Keep at most `max_chunks_per_page` per page, best first
    ///
    /// Pinned ids are placed ahead of everything else when a page is over its
    /// cap. Returns the survivors in relevance order and the number removed.
    pub fn dedup_pages(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        pinned: &AHashSet<ChunkId>,
    ) -> (Vec<ScoredCandidate>, usize) {
        sort_by_final_score(&mut candidates);

        let mut per_page: AHashMap<(String, u32), usize> = AHashMap::new();
        let mut keep = vec![false; candidates.len()];
        let priority = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| pinned.contains(&c.id()))
            .chain(candidates.iter().enumerate().filter(|(_, c)| !pinned.contains(&c.id())));

        for (idx, candidate) in priority {
            let key = (candidate.chunk.source_file.clone(), candidate.chunk.page);
            let count = per_page.entry(key).or_insert(0);
            if *count < self.max_chunks_per_page {
                *count += 1;
                keep[idx] = true;
            }
        }

        let before = candidates.len();
        let survivors: Vec<ScoredCandidate> = candidates
            .into_iter()
            .zip(keep)
            .filter_map(|(c, k)| k.then_some(c))
            .collect();
        let removed = before - survivors.len();
        (survivors, removed)
    }

    /// Select up to `k` candidates; every id in `pinned` that survives page
    /// deduplication is selected as long as `k` allows
    ///
    /// The returned list is in selection order and `final_score` (the MMR score
    /// at selection time) never increases along it.
    pub fn rank(
        &self,
        candidates: Vec<ScoredCandidate>,
        k: usize,
        pinned: &[ChunkId],
    ) -> (Vec<ScoredCandidate>, DiversityStats) {
        let pinned: AHashSet<ChunkId> = pinned.iter().copied().collect();
        let pool_size = candidates.len();
        let (pool, page_duplicates_removed) = self.dedup_pages(candidates, &pinned);

        let mut stats = DiversityStats {
            pool_size,
            page_duplicates_removed,
            ..Default::default()
        };
        if pool.is_empty() || k == 0 {
            return (Vec::new(), stats);
        }

        let relevance = normalized_relevance(&pool);

        if pool.len() <= k {
            let mut selected = pool;
            for (candidate, rel) in selected.iter_mut().zip(&relevance) {
                candidate.apply_diversity(0.0, self.lambda * rel);
            }
            stats.selected = selected.len();
            return (selected, stats);
        }

        let similarity = SimilarityMatrix::new(&pool);
        let mut max_sim = vec![0.0f32; pool.len()];
        let mut chosen = vec![false; pool.len()];
        let mut order: Vec<(usize, f32, f32)> = Vec::with_capacity(k);
        let mut unselected_pinned = pool.iter().filter(|c| pinned.contains(&c.id())).count();

        while order.len() < k && order.len() < pool.len() {
            // Once the remaining slots are only enough for the pinned ones, choose among them
            let restrict = unselected_pinned > 0 && k - order.len() <= unselected_pinned;

            let mut best: Option<(usize, f32, f32)> = None;
            for idx in 0..pool.len() {
                if chosen[idx] || (restrict && !pinned.contains(&pool[idx].id())) {
                    continue;
                }
                let penalty = self.penalty(max_sim[idx], !order.is_empty());
                let score = self.lambda * relevance[idx] - penalty;
                if best.map_or(true, |(_, s, _)| score > s) {
                    best = Some((idx, score, penalty));
                }
            }

            let Some((idx, score, penalty)) = best else {
                break;
            };
            if !order.is_empty() && max_sim[idx] > self.similarity_threshold {
                stats.near_duplicates_penalised += 1;
            }
            if pinned.contains(&pool[idx].id()) {
                unselected_pinned -= 1;
            }
            chosen[idx] = true;
            order.push((idx, score, penalty));

            for other in 0..pool.len() {
                if !chosen[other] {
                    max_sim[other] = max_sim[other].max(similarity.get(idx, other));
                }
            }
        }

        let selected_idx: Vec<usize> = order.iter().map(|(i, _, _)| *i).collect();
        let top_by_relevance: Vec<usize> = (0..order.len()).collect();
        stats.diversity_gain = similarity.mean_pairwise(&top_by_relevance)
            - similarity.mean_pairwise(&selected_idx);
        stats.selected = order.len();

        let mut slots: Vec<Option<ScoredCandidate>> = pool.into_iter().map(Some).collect();
        let mut selected = Vec::with_capacity(order.len());
        for (idx, score, penalty) in order {
            if let Some(mut candidate) = slots[idx].take() {
                candidate.apply_diversity(penalty, score);
                selected.push(candidate);
            }
        }

        tracing::debug!(
            "MMR selected {} of {} ({} page duplicates removed, {} near-duplicates penalised)",
            stats.selected,
            stats.pool_size,
            stats.page_duplicates_removed,
            stats.near_duplicates_penalised
        );
        (selected, stats)
    }

    fn penalty(&self, max_sim: f32, has_selection: bool) -> f32 {
        if !has_selection {
            return 0.0;
        }
        let mut penalty = (1.0 - self.lambda) * max_sim;
        if max_sim > self.similarity_threshold {
            penalty += 1.0 - self.lambda;
        }
        penalty
    }
}

/// Min-max normalised relevance in pool order; all 1.0 when the scores are flat
fn normalized_relevance(pool: &[ScoredCandidate]) -> Vec<f32> {
    let raw: Vec<f32> = pool.iter().map(|c| c.relevance()).collect();
    let min = raw.iter().copied().fold(f32::INFINITY, f32::min);
    let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;
    if !span.is_finite() || span <= f32::EPSILON {
        return vec![1.0; raw.len()];
    }
    raw.iter().map(|r| (r - min) / span).collect()
}

/// Pairwise similarities, computed once per pool
struct SimilarityMatrix {
    n: usize,
    values: Vec<f32>,
}

impl SimilarityMatrix {
    fn new(pool: &[ScoredCandidate]) -> Self {
        let n = pool.len();
        let mut values = vec![0.0f32; n * n];
        for i in 0..n {
            values[i * n + i] = 1.0;
            for j in (i + 1)..n {
                let sim = pair_similarity(&pool[i], &pool[j]);
                values[i * n + j] = sim;
                values[j * n + i] = sim;
            }
        }
        Self { n, values }
    }

    fn get(&self, i: usize, j: usize) -> f32 {
        self.values[i * self.n + j]
    }

    fn mean_pairwise(&self, idx: &[usize]) -> f32 {
        let mut sum = 0.0;
        let mut pairs = 0usize;
        for (a, &i) in idx.iter().enumerate() {
            for &j in &idx[a + 1..] {
                sum += self.get(i, j);
                pairs += 1;
            }
        }
        if pairs == 0 {
            0.0
        } else {
            sum / pairs as f32
        }
    }
}

/// Cosine over embeddings; token overlap when either chunk has none
fn pair_similarity(a: &ScoredCandidate, b: &ScoredCandidate) -> f32 {
    if a.chunk.embedding.is_empty() || b.chunk.embedding.is_empty() {
        token_overlap(&a.chunk.text, &b.chunk.text)
    } else {
        cosine_similarity(&a.chunk.embedding, &b.chunk.embedding)
    }
}
