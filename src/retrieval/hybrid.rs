//! Hybrid search combining keyword and vector backends
//!
//! Both backends are queried concurrently, each on the blocking pool under its
//! own timeout. A failed or slow backend is reported as a degradation and
//! fusion proceeds with the surviving list; only when neither produced a list
//! does the search fail.

use crate::config::{FeatureFlags, TimeoutConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{NoResultsReason, QuarryError, Result};
use crate::index::{CandidateRef, KeywordBackend, VectorBackend};
use crate::pipeline::{call_blocking, Deadline, Degradation};
use crate::retrieval::{reciprocal_rank_fusion, FusedHit, FusionConfig, QualityFilter, ScoredCandidate};
use crate::storage::{ChunkId, ChunkStore, StorageError};
use ahash::AHashMap;
use std::sync::Arc;

const FILTERED_FETCH_GROWTH: usize = 4;
const MAX_FILTERED_FETCH: usize = 4096;

/// Fused, hydrated and quality-adjusted candidates for one query
#[derive(Debug)]
pub struct RetrievalOutcome {
    /// Sorted by `final_score`, at most `top_k_initial`
    pub candidates: Vec<ScoredCandidate>,
    /// Query vector, when the embedding service answered
    pub query_embedding: Option<Vec<f32>>,
    pub degradations: Vec<Degradation>,
}

/// Fans a query out to the backends and fuses what comes back
pub struct HybridSearcher {
    keyword: Option<Arc<dyn KeywordBackend>>,
    vector: Option<Arc<dyn VectorBackend>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    store: Arc<dyn ChunkStore>,
    fusion: FusionConfig,
    quality: Option<QualityFilter>,
    hybrid_enabled: bool,
    timeouts: TimeoutConfig,
}

impl HybridSearcher {
    /// Searcher with no backends attached yet
    pub fn new(store: Arc<dyn ChunkStore>, fusion: FusionConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            keyword: None,
            vector: None,
            embedder: None,
            store,
            fusion,
            quality: None,
            hybrid_enabled: true,
            timeouts,
        }
    }

    pub fn with_keyword(mut self, backend: Arc<dyn KeywordBackend>) -> Self {
        self.keyword = Some(backend);
        self
    }

    /// Vector search needs an embedding provider for the query vector
    pub fn with_vector(mut self, backend: Arc<dyn VectorBackend>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.vector = Some(backend);
        self.embedder = Some(embedder);
        self
    }

    pub fn with_quality_filter(mut self, filter: QualityFilter) -> Self {
        self.quality = Some(filter);
        self
    }

    pub fn with_features(mut self, features: &FeatureFlags) -> Self {
        self.hybrid_enabled = features.hybrid_search;
        self
    }

    pub fn embedder(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.embedder.clone()
    }

    /// Embed the query under the embedding timeout
    pub async fn embed_query(&self, query: &str, deadline: &Deadline) -> std::result::Result<Vec<f32>, String> {
        let Some(embedder) = self.embedder.clone() else {
            return Err("no embedding provider configured".to_string());
        };
        let text = query.to_string();
        match call_blocking(deadline.bound(self.timeouts.embed()), move || embedder.embed(&text)).await {
            Ok(Ok(embedding)) => Ok(embedding),
            Ok(Err(e)) => Err(e.to_string()),
            Err(failure) => Err(format!("embedding call {}", failure)),
        }
    }

    /// Search, fuse, hydrate, filter and quality-adjust
    ///
    /// # Arguments
    /// * `query` - normalized query text
    /// * `top_k_initial` - cap on the fused list, counted after filtering
    /// * `file_filter` - case-insensitive substring of `source_file`
    pub async fn retrieve(
        &self,
        query: &str,
        top_k_initial: usize,
        file_filter: Option<&str>,
        deadline: &Deadline,
    ) -> Result<RetrievalOutcome> {
        let mut degradations = Vec::new();

        // Keyword-only corpora still work when hybrid search is switched off
        let use_keyword = self.keyword.is_some() && (self.hybrid_enabled || self.vector.is_none());

        let query_embedding = match &self.vector {
            Some(_) => match self.embed_query(query, deadline).await {
                Ok(embedding) => Some(embedding),
                Err(message) => {
                    tracing::warn!("Query embedding unavailable, skipping vector search: {}", message);
                    degradations.push(Degradation::EmbeddingUnavailable { message });
                    None
                }
            },
            None => None,
        };

        // A file filter is applied to hydrated chunks, so a filtered query keeps
        // widening the backend fetch until it has its own top_k_initial or the
        // backends run dry.
        let mut fetch_k = top_k_initial;
        let mut candidates = loop {
            let round = self
                .search_backends(query, query_embedding.as_ref(), fetch_k, use_keyword, deadline)
                .await;
            let (keyword_hits, vector_hits) = match (round.keyword, round.vector) {
                (None, None) => {
                    degradations.extend(round.degradations);
                    return Err(QuarryError::NoResults {
                        reason: NoResultsReason::BackendsUnavailable,
                    });
                }
                (keyword, vector) => (keyword.unwrap_or_default(), vector.unwrap_or_default()),
            };
            tracing::debug!(
                "Backends returned {} keyword and {} vector hits (k = {})",
                keyword_hits.len(),
                vector_hits.len(),
                fetch_k
            );

            let Some(filter) = file_filter else {
                degradations.extend(round.degradations);
                let fused = reciprocal_rank_fusion(&keyword_hits, &vector_hits, &self.fusion, top_k_initial);
                if fused.is_empty() {
                    return Err(QuarryError::NoResults {
                        reason: NoResultsReason::NothingMatched,
                    });
                }
                break self.hydrate(fused, deadline).await?;
            };

            let exhausted = keyword_hits.len() < fetch_k && vector_hits.len() < fetch_k;
            let fused = reciprocal_rank_fusion(&keyword_hits, &vector_hits, &self.fusion, usize::MAX);
            let mut matching = self.hydrate(fused, deadline).await?;
            let needle = filter.to_lowercase();
            matching.retain(|c| c.chunk.source_file.to_lowercase().contains(&needle));

            if matching.len() >= top_k_initial
                || exhausted
                || fetch_k >= MAX_FILTERED_FETCH
                || deadline.expired()
            {
                degradations.extend(round.degradations);
                matching.truncate(top_k_initial);
                break matching;
            }
            tracing::debug!(
                "Only {} hits match filter '{}', widening fetch beyond {}",
                matching.len(),
                filter,
                fetch_k
            );
            fetch_k = (fetch_k.max(1) * FILTERED_FETCH_GROWTH).min(MAX_FILTERED_FETCH);
        };

        if candidates.is_empty() {
            return Err(QuarryError::NoResults {
                reason: NoResultsReason::NothingMatched,
            });
        }

        if let Some(quality) = &self.quality {
            quality.apply(&mut candidates);
        }

        Ok(RetrievalOutcome {
            candidates,
            query_embedding,
            degradations,
        })
    }

    /// One concurrent round against both backends
    async fn search_backends(
        &self,
        query: &str,
        embedding: Option<&Vec<f32>>,
        k: usize,
        use_keyword: bool,
        deadline: &Deadline,
    ) -> BackendRound {
        let (keyword_result, vector_result) = tokio::join!(
            self.keyword_search(query, k, use_keyword, deadline),
            self.vector_search(embedding.cloned(), k, deadline)
        );

        let mut degradations = Vec::new();
        let keyword = match keyword_result {
            BackendResult::Hits(hits) => Some(hits),
            BackendResult::Skipped => None,
            BackendResult::Failed(message) => {
                tracing::warn!("Keyword backend unavailable: {}", message);
                degradations.push(Degradation::KeywordBackendUnavailable { message });
                None
            }
        };
        let vector = match vector_result {
            BackendResult::Hits(hits) => Some(hits),
            BackendResult::Skipped => {
                if self.vector.is_some() {
                    degradations.push(Degradation::VectorBackendUnavailable {
                        message: "no query embedding".to_string(),
                    });
                }
                None
            }
            BackendResult::Failed(message) => {
                tracing::warn!("Vector backend unavailable: {}", message);
                degradations.push(Degradation::VectorBackendUnavailable { message });
                None
            }
        };
        BackendRound {
            keyword,
            vector,
            degradations,
        }
    }

    async fn keyword_search(
        &self,
        query: &str,
        k: usize,
        enabled: bool,
        deadline: &Deadline,
    ) -> BackendResult {
        let Some(backend) = self.keyword.clone().filter(|_| enabled) else {
            return BackendResult::Skipped;
        };
        let text = query.to_string();
        let limit = deadline.bound(self.timeouts.backend());
        match call_blocking(limit, move || backend.search(&text, k)).await {
            Ok(Ok(hits)) => BackendResult::Hits(hits),
            Ok(Err(e)) => BackendResult::Failed(e.to_string()),
            Err(failure) => BackendResult::Failed(format!("keyword search {}", failure)),
        }
    }

    async fn vector_search(
        &self,
        embedding: Option<Vec<f32>>,
        k: usize,
        deadline: &Deadline,
    ) -> BackendResult {
        let (Some(backend), Some(embedding)) = (self.vector.clone(), embedding) else {
            return BackendResult::Skipped;
        };
        if embedding.len() != backend.dimension() {
            return BackendResult::Failed(format!(
                "query embedding has {} dimensions, index expects {}",
                embedding.len(),
                backend.dimension()
            ));
        }
        let limit = deadline.bound(self.timeouts.backend());
        match call_blocking(limit, move || backend.search(&embedding, k)).await {
            Ok(Ok(hits)) => BackendResult::Hits(hits),
            Ok(Err(e)) => BackendResult::Failed(e.to_string()),
            Err(failure) => BackendResult::Failed(format!("vector search {}", failure)),
        }
    }

    /// Attach chunk bodies to fused hits; ids the store does not know are dropped
    async fn hydrate(&self, fused: Vec<FusedHit>, deadline: &Deadline) -> Result<Vec<ScoredCandidate>> {
        let ids: Vec<ChunkId> = fused.iter().map(|h| h.id).collect();
        let store = Arc::clone(&self.store);
        let chunks = call_blocking(deadline.bound(self.timeouts.backend()), move || {
            store.get_chunks(&ids)
        })
        .await
        .map_err(|failure| StorageError::Unavailable(format!("chunk lookup {}", failure)))??;

        let mut by_id: AHashMap<ChunkId, _> = chunks.into_iter().map(|c| (c.id, c)).collect();
        let mut candidates = Vec::with_capacity(fused.len());
        for hit in fused {
            let Some(chunk) = by_id.remove(&hit.id) else {
                tracing::debug!("Chunk {} missing from store, skipping", hit.id);
                continue;
            };
            let mut candidate = ScoredCandidate::fused(chunk, hit.fused_score);
            candidate.keyword_rank = hit.keyword_rank;
            candidate.keyword_score = hit.keyword_score;
            candidate.vector_rank = hit.vector_rank;
            candidate.vector_score = hit.vector_score;
            candidates.push(candidate);
        }
        Ok(candidates)
    }
}

struct BackendRound {
    keyword: Option<Vec<CandidateRef>>,
    vector: Option<Vec<CandidateRef>>,
    degradations: Vec<Degradation>,
}

enum BackendResult {
    Hits(Vec<CandidateRef>),
    Skipped,
    Failed(String),
}
