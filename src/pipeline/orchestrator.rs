//! Query orchestration
//!
//! resolve -> cache lookup -> route -> retrieve (or decompose and fan out)
//! -> rerank -> diversify -> extract evidence -> compress. The request
//! deadline is checked before every stage that calls a collaborator; an
//! expired deadline skips the stage and returns what has been built so far.

use crate::cache::{CacheKey, ResponseCache};
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::PipelineConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{QuarryError, Result};
use crate::evidence::{total_chars, ContextCompressor, EvidenceExtractor};
use crate::index::{KeywordBackend, VectorBackend};
use crate::pipeline::{
    call_blocking, normalize_query, validate_query, CandidateTrace, Deadline, DebugView, Degradation,
    PipelineStage, QueryRequest, ResultBundle, RoutingMetadata, SearchResponse, StageTiming,
};
use crate::retrieval::{
    assign_ranks, merge_subquery_results, sort_by_final_score, DiversityRanker, DiversityStats,
    FusionConfig, HybridSearcher, QualityFilter, RelevanceReranker, RelevanceScorer,
    ScoredCandidate,
};
use crate::routing::{
    AmbiguityResolver, Classification, Decomposition, LlmSplitter, QueryDecomposer, QueryRouter,
    QueryType, RoutingDecision, RuleBasedResolver, Strategy,
};
use crate::session::{ConversationContext, ConversationMemory, ResolvedQuery};
use crate::storage::{ChunkId, ChunkStore};
use ahash::AHashSet;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Candidates ranked for one query text
struct Ranked {
    candidates: Vec<ScoredCandidate>,
    query_embedding: Option<Vec<f32>>,
    diversity: Option<DiversityStats>,
    traces: Vec<CandidateTrace>,
}

impl Ranked {
    fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            query_embedding: None,
            diversity: None,
            traces: Vec::new(),
        }
    }
}

/// Wires collaborators into a [`Pipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Arc<dyn ChunkStore>,
    keyword: Option<Arc<dyn KeywordBackend>>,
    vector: Option<(Arc<dyn VectorBackend>, Arc<dyn EmbeddingProvider>)>,
    scorer: Option<Arc<dyn RelevanceScorer>>,
    resolver: Option<Arc<dyn AmbiguityResolver>>,
    splitter: Option<LlmSplitter>,
    clock: SharedClock,
    memory: Option<Arc<ConversationMemory>>,
    cache: Option<Arc<ResponseCache<ResultBundle>>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig, store: Arc<dyn ChunkStore>) -> Self {
        Self {
            config,
            store,
            keyword: None,
            vector: None,
            scorer: None,
            resolver: None,
            splitter: None,
            clock: Arc::new(SystemClock),
            memory: None,
            cache: None,
        }
    }

    pub fn keyword(mut self, backend: Arc<dyn KeywordBackend>) -> Self {
        self.keyword = Some(backend);
        self
    }

    pub fn vector(mut self, backend: Arc<dyn VectorBackend>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.vector = Some((backend, embedder));
        self
    }

    pub fn reranker(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Replaces the default rule-based resolver
    pub fn resolver(mut self, resolver: Arc<dyn AmbiguityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn splitter(mut self, splitter: LlmSplitter) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Share a session store between pipelines
    pub fn memory(mut self, memory: Arc<ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache<ResultBundle>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        let fusion = FusionConfig::from_retrieval(&config.retrieval)
            .map_err(|e| QuarryError::Config(e.to_string()))?;

        let mut searcher = HybridSearcher::new(self.store, fusion, config.timeouts.clone())
            .with_features(&config.features);
        if let Some(keyword) = self.keyword {
            searcher = searcher.with_keyword(keyword);
        }
        if let Some((vector, embedder)) = self.vector {
            searcher = searcher.with_vector(vector, embedder);
        }
        if config.features.quality_filter {
            searcher = searcher.with_quality_filter(QualityFilter::new(&config.quality));
        }

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(RuleBasedResolver));
        let router = QueryRouter::new(&config.routing, &config.retrieval)
            .map_err(|e| QuarryError::Config(e.to_string()))?
            .with_resolver(resolver);

        let mut decomposer = QueryDecomposer::new(config.routing.max_sub_queries)
            .map_err(|e| QuarryError::Config(e.to_string()))?;
        if let Some(splitter) = self.splitter {
            decomposer = decomposer.with_splitter(splitter);
        }

        let reranker = self.scorer.map(|scorer| {
            RelevanceReranker::new(scorer, config.retrieval.rerank_top_n, config.timeouts.rerank())
        });
        let extractor = EvidenceExtractor::new(&config.evidence, searcher.embedder(), config.timeouts.embed());

        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(ConversationMemory::new(&config.session, self.clock.clone())));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ResponseCache::new(&config.cache, self.clock.clone())));

        tracing::info!(
            "Pipeline ready (reranker: {}, features: {:?})",
            reranker.is_some(),
            config.features
        );

        Ok(Pipeline {
            diversity: DiversityRanker::new(&config.diversity),
            compressor: ContextCompressor::new(&config.compression),
            searcher,
            router: Arc::new(router),
            decomposer: Arc::new(decomposer),
            reranker,
            extractor,
            memory,
            cache,
            clock: self.clock,
            config,
        })
    }
}

/// Retrieval and ranking for one corpus
///
/// Shared by reference across requests; every mutable piece (routing stats,
/// sessions, cache) synchronises itself.
pub struct Pipeline {
    config: PipelineConfig,
    searcher: HybridSearcher,
    router: Arc<QueryRouter>,
    decomposer: Arc<QueryDecomposer>,
    reranker: Option<RelevanceReranker>,
    diversity: DiversityRanker,
    extractor: EvidenceExtractor,
    compressor: ContextCompressor,
    memory: Arc<ConversationMemory>,
    cache: Arc<ResponseCache<ResultBundle>>,
    clock: SharedClock,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig, store: Arc<dyn ChunkStore>) -> PipelineBuilder {
        PipelineBuilder::new(config, store)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn router(&self) -> &QueryRouter {
        &self.router
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn cache(&self) -> &ResponseCache<ResultBundle> {
        &self.cache
    }

    /// Run one query
    ///
    /// Fails only for invalid input, when both backends are unavailable, or
    /// when nothing matched. Every other problem is recorded in
    /// `routing.degradations` of the returned bundle.
    pub async fn search(&self, request: QueryRequest) -> Result<SearchResponse> {
        let normalized = normalize_query(&request.text);
        validate_query(&normalized, self.config.retrieval.max_query_chars)?;

        let features = &self.config.features;
        let deadline = Deadline::after(
            request
                .deadline
                .unwrap_or_else(|| self.config.timeouts.request_deadline()),
        );
        let bundle_id = Uuid::new_v4();
        let mut degradations: Vec<Degradation> = Vec::new();
        let mut timings: Vec<StageTiming> = Vec::new();

        let session_id = request
            .session_id
            .as_deref()
            .filter(|_| features.conversation_memory);
        let resolved = match session_id {
            Some(sid) => self.memory.resolve(sid, &normalized),
            None => ResolvedQuery {
                text: normalized.clone(),
                expanded: false,
                context: ConversationContext::default(),
            },
        };

        let budget = request
            .budget
            .unwrap_or(self.config.compression.max_context_chars);
        let filter = request.file_filter.as_deref();
        let cache_key = features
            .caching
            .then(|| cache_key(&resolved.text, filter, budget, request.decompose));
        if let Some(key) = &cache_key {
            if let Some(bundle) = self.cache.get(key) {
                tracing::info!("Cache hit for '{}'", resolved.text);
                if let Some(sid) = session_id {
                    self.memory.append(sid, &normalized, &bundle.summary());
                }
                return Ok(SearchResponse {
                    bundle,
                    from_cache: true,
                    debug: None,
                });
            }
        }

        let started = Instant::now();
        let decision = self
            .route(&resolved, session_id.is_some(), &deadline, &mut degradations)
            .await;
        timings.push(timing(PipelineStage::Routing, started));

        let mut strategy = decision.strategy.clone();
        strategy.decompose =
            features.decomposition && request.decompose.unwrap_or(strategy.decompose);

        let started = Instant::now();
        let mut sub_queries = Vec::new();
        let mut decomposed: Option<Ranked> = None;
        if strategy.decompose {
            match self.decompose(&resolved.text, bundle_id, &deadline).await {
                Ok(Some(decomposition)) => {
                    self.router.record_decomposition();
                    decomposed = self
                        .run_decomposed(&resolved.text, &decomposition, &strategy, filter, &deadline, &mut degradations)
                        .await;
                    if decomposed.is_some() {
                        sub_queries = decomposition.sub_queries;
                    } else {
                        degradations.push(Degradation::DecompositionFailed {
                            message: "no sub-query returned results".to_string(),
                        });
                        strategy = self.factual_fallback(&decision.classification);
                    }
                }
                Ok(None) => {
                    tracing::debug!("'{}' does not split, running as a single query", resolved.text);
                    strategy.decompose = false;
                }
                Err(message) => {
                    tracing::warn!("Decomposition failed, running as a single query: {}", message);
                    degradations.push(Degradation::DecompositionFailed { message });
                    strategy = self.factual_fallback(&decision.classification);
                }
            }
        }

        let ranked = match decomposed {
            Some(ranked) => ranked,
            None => {
                self.rank_query(
                    &resolved.text,
                    strategy.top_k_initial,
                    strategy.top_k_final,
                    filter,
                    &deadline,
                    &mut degradations,
                )
                .await?
            }
        };
        timings.push(timing(PipelineStage::Retrieval, started));

        let Ranked {
            mut candidates,
            query_embedding,
            diversity,
            traces,
        } = ranked;

        let started = Instant::now();
        let (sentences, evidence_scoring) = if !features.evidence_extraction {
            (self.extractor.passthrough(&candidates), None)
        } else if deadline.expired() {
            degradations.push(Degradation::DeadlineExceeded {
                stage: PipelineStage::Evidence,
            });
            (self.extractor.passthrough(&candidates), None)
        } else {
            let outcome = self
                .extractor
                .extract(&resolved.text, query_embedding.as_deref(), &candidates, &deadline)
                .await;
            degradations.extend(outcome.degradation);
            (outcome.sentences, Some(outcome.scoring))
        };
        timings.push(timing(PipelineStage::Evidence, started));

        let started = Instant::now();
        let (evidence, compression) = if features.compression {
            let scaled = (budget as f32 * strategy.compression.budget_factor()).floor() as usize;
            let (kept, stats) = self.compressor.compress(sentences, scaled);
            (kept, Some(stats))
        } else {
            (sentences, None)
        };
        timings.push(timing(PipelineStage::Compression, started));

        let with_evidence: AHashSet<ChunkId> = evidence.iter().map(|s| s.chunk_id).collect();
        candidates.retain(|c| with_evidence.contains(&c.id()));
        assign_ranks(&mut candidates);

        let routing = RoutingMetadata {
            query_type: decision.classification.query_type,
            confidence: decision.classification.confidence,
            complexity: decision.classification.complexity,
            route: decision.route,
            decomposed: !sub_queries.is_empty(),
            strategy,
            resolved_query: resolved.text.clone(),
            expanded_from_session: resolved.expanded,
            sub_queries,
            compression_ratio: compression.as_ref().map_or(1.0, |c| c.ratio),
            compression,
            diversity,
            evidence_scoring,
            degradations: dedup_degradations(degradations),
        };
        let bundle = ResultBundle {
            id: bundle_id,
            query: normalized.clone(),
            created_at: self.clock.now(),
            total_chars: total_chars(&evidence),
            candidates,
            evidence,
            routing,
        };

        tracing::info!(
            "Query '{}' returned {} candidates, {} evidence chars ({} degradations)",
            normalized,
            bundle.candidates.len(),
            bundle.total_chars,
            bundle.routing.degradations.len()
        );

        if let Some(key) = cache_key {
            if bundle.is_degraded() {
                tracing::debug!("Not caching degraded bundle {}", bundle.id);
            } else {
                self.cache.put(key, bundle.clone());
            }
        }
        if let Some(sid) = session_id {
            self.memory.append(sid, &normalized, &bundle.summary());
        }

        let debug = request.debug.then(|| debug_view(traces, &bundle.candidates, timings));
        Ok(SearchResponse {
            bundle,
            from_cache: false,
            debug,
        })
    }

    async fn route(
        &self,
        resolved: &ResolvedQuery,
        with_context: bool,
        deadline: &Deadline,
        degradations: &mut Vec<Degradation>,
    ) -> RoutingDecision {
        let router = Arc::clone(&self.router);
        let text = resolved.text.clone();
        let context = with_context.then(|| resolved.context.clone());
        let limit = deadline.bound(self.config.timeouts.classifier());

        match call_blocking(limit, move || router.route(&text, context.as_ref())).await {
            Ok(decision) => decision,
            Err(failure) => {
                tracing::warn!("Classifier {}, routing conservatively", failure);
                degradations.push(Degradation::ClassifierFailed {
                    message: failure.to_string(),
                });
                self.router.conservative()
            }
        }
    }

    async fn decompose(
        &self,
        text: &str,
        parent_query_id: Uuid,
        deadline: &Deadline,
    ) -> std::result::Result<Option<Decomposition>, String> {
        let decomposer = Arc::clone(&self.decomposer);
        let owned = text.to_string();
        let limit = deadline.bound(self.config.timeouts.classifier());
        match call_blocking(limit, move || decomposer.decompose(&owned, parent_query_id)).await {
            Ok(Ok(decomposition)) => Ok(Some(decomposition)),
            Ok(Err(e)) if e.is_not_decomposable() => Ok(None),
            Ok(Err(e)) => Err(e.to_string()),
            Err(failure) => Err(format!("decomposition {}", failure)),
        }
    }

    /// Single factual request used when a decomposed run cannot be completed
    fn factual_fallback(&self, classification: &Classification) -> Strategy {
        let mut strategy = self.router.strategy_for(&Classification {
            query_type: QueryType::Factual,
            ..classification.clone()
        });
        strategy.decompose = false;
        strategy
    }

    /// Retrieve, rerank and diversify one query text
    async fn rank_query(
        &self,
        text: &str,
        top_k_initial: usize,
        top_k_final: usize,
        filter: Option<&str>,
        deadline: &Deadline,
        degradations: &mut Vec<Degradation>,
    ) -> Result<Ranked> {
        if deadline.expired() {
            degradations.push(Degradation::DeadlineExceeded {
                stage: PipelineStage::Retrieval,
            });
            return Ok(Ranked::empty());
        }

        let outcome = self
            .searcher
            .retrieve(text, top_k_initial, filter, deadline)
            .await?;
        degradations.extend(outcome.degradations);
        let traces: Vec<CandidateTrace> = outcome
            .candidates
            .iter()
            .map(CandidateTrace::from_candidate)
            .collect();
        let mut candidates = outcome.candidates;

        if let Some(reranker) = self.reranker.as_ref().filter(|_| self.config.features.reranking) {
            if deadline.expired() {
                degradations.push(Degradation::DeadlineExceeded {
                    stage: PipelineStage::Rerank,
                });
            } else {
                let outcome = reranker.rerank(text, candidates, deadline).await;
                candidates = outcome.candidates;
                degradations.extend(outcome.degradation);
            }
        }

        let (candidates, diversity) = self.diversify(candidates, top_k_final, &[]);
        Ok(Ranked {
            candidates,
            query_embedding: outcome.query_embedding,
            diversity,
            traces,
        })
    }

    /// Sub-queries run concurrently; `None` when none of them produced anything
    async fn run_decomposed(
        &self,
        text: &str,
        decomposition: &Decomposition,
        strategy: &Strategy,
        filter: Option<&str>,
        deadline: &Deadline,
        degradations: &mut Vec<Degradation>,
    ) -> Option<Ranked> {
        let per_sub_query = self.config.routing.max_docs_per_subquery;
        let runs = decomposition.sub_queries.iter().map(|sub| async move {
            let mut local = Vec::new();
            let result = self
                .rank_query(&sub.text, strategy.top_k_initial, per_sub_query, filter, deadline, &mut local)
                .await;
            (sub.order, result, local)
        });

        let mut lists = Vec::new();
        let mut traces: Vec<CandidateTrace> = Vec::new();
        let mut traced: AHashSet<ChunkId> = AHashSet::new();
        for (order, result, local) in join_all(runs).await {
            degradations.extend(local);
            match result {
                Ok(ranked) => {
                    for trace in ranked.traces {
                        if traced.insert(trace.chunk_id) {
                            traces.push(trace);
                        }
                    }
                    lists.push((order, ranked.candidates));
                }
                Err(e) => {
                    tracing::warn!("Sub-query {} failed: {}", order, e);
                    degradations.push(Degradation::SubQueryFailed {
                        order,
                        message: e.to_string(),
                    });
                }
            }
        }

        if lists.iter().all(|(_, candidates)| candidates.is_empty()) {
            return None;
        }
        if deadline.expired() {
            degradations.push(Degradation::DeadlineExceeded {
                stage: PipelineStage::Merge,
            });
        }

        let merged = merge_subquery_results(lists);
        tracing::debug!(
            "Merged {} sub-query results into {} candidates",
            decomposition.sub_queries.len(),
            merged.candidates.len()
        );
        let (candidates, diversity) = self.diversify(merged.candidates, strategy.top_k_final, &merged.pinned);

        // Evidence is scored against the original question, not the sub-queries
        let query_embedding = if self.config.features.evidence_extraction && !deadline.expired() {
            self.searcher.embed_query(text, deadline).await.ok()
        } else {
            None
        };

        Some(Ranked {
            candidates,
            query_embedding,
            diversity,
            traces,
        })
    }

    fn diversify(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        k: usize,
        pinned: &[ChunkId],
    ) -> (Vec<ScoredCandidate>, Option<DiversityStats>) {
        if self.config.features.diversity {
            let (selected, stats) = self.diversity.rank(candidates, k, pinned);
            (selected, Some(stats))
        } else {
            sort_by_final_score(&mut candidates);
            candidates.truncate(k);
            (candidates, None)
        }
    }
}

fn cache_key(text: &str, filter: Option<&str>, budget: usize, decompose: Option<bool>) -> CacheKey {
    let key = CacheKey::new(text, filter, budget);
    match decompose {
        Some(value) => key.with_option("decompose", if value { "true" } else { "false" }),
        None => key,
    }
}

fn timing(stage: PipelineStage, started: Instant) -> StageTiming {
    StageTiming {
        stage,
        millis: started.elapsed().as_millis() as u64,
    }
}

/// Keep the first of each identical degradation (sub-queries repeat them)
fn dedup_degradations(degradations: Vec<Degradation>) -> Vec<Degradation> {
    let mut unique: Vec<Degradation> = Vec::with_capacity(degradations.len());
    for d in degradations {
        if !unique.contains(&d) {
            unique.push(d);
        }
    }
    unique
}

fn debug_view(
    mut traces: Vec<CandidateTrace>,
    survivors: &[ScoredCandidate],
    timings: Vec<StageTiming>,
) -> DebugView {
    for trace in traces.iter_mut() {
        if let Some(candidate) = survivors.iter().find(|c| c.id() == trace.chunk_id) {
            *trace = CandidateTrace::from_candidate(candidate);
            trace.rank = Some(candidate.rank);
            trace.survived = true;
        }
    }
    DebugView {
        candidates: traces,
        timings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_degradations_keeps_order() {
        let input = vec![
            Degradation::RerankTimedOut,
            Degradation::EvidenceScoringFallback,
            Degradation::RerankTimedOut,
        ];
        assert_eq!(
            dedup_degradations(input),
            vec![Degradation::RerankTimedOut, Degradation::EvidenceScoringFallback]
        );
    }

    #[test]
    fn test_cache_key_depends_on_override() {
        let plain = cache_key("q", None, 100, None);
        assert_ne!(plain, cache_key("q", None, 100, Some(true)));
        assert_ne!(cache_key("q", None, 100, Some(false)), cache_key("q", None, 100, Some(true)));
    }
}
