//! Maps a classification to a named route and a retrieval strategy

use crate::config::{RetrievalConfig, RoutingConfig};
use crate::routing::{
    AmbiguityResolver, Classification, ClassifyError, Complexity, QueryClassifier, QueryType,
};
use crate::session::ConversationContext;
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Reference point of the per-type result counts below
const BASE_TOP_K_FINAL: usize = 5;
const MAX_TOP_K_FINAL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    FastFactual,
    DetailedFactual,
    ComparativeAnalysis,
    DeepAnalysis,
    ExploratoryOverview,
    MultiHopReasoning,
    Conversational,
    Standard,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::FastFactual => "fast_factual",
            Route::DetailedFactual => "detailed_factual",
            Route::ComparativeAnalysis => "comparative_analysis",
            Route::DeepAnalysis => "deep_analysis",
            Route::ExploratoryOverview => "exploratory_overview",
            Route::MultiHopReasoning => "multi_hop_reasoning",
            Route::Conversational => "conversational",
            Route::Standard => "standard",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How hard the context compressor squeezes the evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAggressiveness {
    Light,
    Normal,
    Aggressive,
}

impl CompressionAggressiveness {
    /// Multiplier applied to the character budget
    pub fn budget_factor(&self) -> f32 {
        match self {
            CompressionAggressiveness::Light | CompressionAggressiveness::Normal => 1.0,
            CompressionAggressiveness::Aggressive => 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub top_k_initial: usize,
    pub top_k_final: usize,
    pub decompose: bool,
    pub use_memory: bool,
    pub compression: CompressionAggressiveness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub classification: Classification,
    pub route: Route,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingStats {
    pub total_queries: u64,
    pub by_type: HashMap<QueryType, u64>,
    pub by_route: HashMap<Route, u64>,
    pub simple_queries: u64,
    pub complex_queries: u64,
    pub resolver_consultations: u64,
    pub decompositions: u64,
}

pub struct QueryRouter {
    classifier: QueryClassifier,
    resolver: Option<Arc<dyn AmbiguityResolver>>,
    ambiguity_threshold: f32,
    top_k_initial: usize,
    top_k_final: usize,
    stats: Mutex<RoutingStats>,
}

impl QueryRouter {
    pub fn new(routing: &RoutingConfig, retrieval: &RetrievalConfig) -> Result<Self, ClassifyError> {
        Ok(Self {
            classifier: QueryClassifier::new()?,
            resolver: None,
            ambiguity_threshold: routing.ambiguity_threshold,
            top_k_initial: retrieval.top_k_initial,
            top_k_final: retrieval.top_k_final,
            stats: Mutex::new(RoutingStats::default()),
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AmbiguityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Rules first, then the resolver when the rules are unsure
    ///
    /// A failing resolver leaves the rule result in place.
    pub fn classify(&self, query: &str, context: Option<&ConversationContext>) -> Classification {
        let rules = self.classifier.classify(query, context);
        if rules.confidence >= self.ambiguity_threshold {
            return rules;
        }
        let Some(resolver) = &self.resolver else {
            return rules;
        };

        self.with_stats(|s| s.resolver_consultations += 1);
        match resolver.resolve(query, &rules) {
            Ok(resolved) => {
                tracing::debug!(
                    "Resolver '{}' classified '{}' as {} (rules said {})",
                    resolver.name(),
                    query,
                    resolved.query_type,
                    rules.query_type
                );
                resolved
            }
            Err(e) => {
                tracing::warn!("Ambiguity resolver '{}' failed: {}", resolver.name(), e);
                rules
            }
        }
    }

    pub fn route_for(classification: &Classification) -> Route {
        match (classification.query_type, classification.complexity) {
            (QueryType::Factual, Complexity::Simple) => Route::FastFactual,
            (QueryType::Factual, Complexity::Complex) => Route::DetailedFactual,
            (QueryType::Comparative, _) => Route::ComparativeAnalysis,
            (QueryType::Analytical, _) => Route::DeepAnalysis,
            (QueryType::Exploratory, _) => Route::ExploratoryOverview,
            (QueryType::MultiHop, _) => Route::MultiHopReasoning,
            (QueryType::Conversational, _) => Route::Conversational,
        }
    }

    /// Retrieval parameters for a classification
    ///
    /// Per-type result counts scale with the configured `top_k_final`; with
    /// the default of 5 a factual query gets 5 and an exploratory one 15.
    pub fn strategy_for(&self, classification: &Classification) -> Strategy {
        let (base_k, decompose, use_memory, compression) = match classification.query_type {
            QueryType::Factual => (5, false, false, CompressionAggressiveness::Normal),
            QueryType::Comparative => (10, true, false, CompressionAggressiveness::Light),
            QueryType::Analytical => (8, true, false, CompressionAggressiveness::Light),
            QueryType::Exploratory => (15, false, false, CompressionAggressiveness::Aggressive),
            QueryType::MultiHop => (10, true, false, CompressionAggressiveness::Light),
            QueryType::Conversational => (5, false, true, CompressionAggressiveness::Normal),
        };

        let mut top_k_final = scale_k(base_k, self.top_k_final);
        let mut decompose = decompose;
        if classification.complexity == Complexity::Complex {
            top_k_final = (top_k_final * 2).min(MAX_TOP_K_FINAL.max(self.top_k_final));
            decompose = !matches!(
                classification.query_type,
                QueryType::Factual | QueryType::Conversational
            );
        }

        Strategy {
            top_k_initial: self.top_k_initial.max(top_k_final),
            top_k_final,
            decompose,
            use_memory,
            compression,
        }
    }

    /// Classify, pick the route and strategy, and record the decision
    pub fn route(&self, query: &str, context: Option<&ConversationContext>) -> RoutingDecision {
        let classification = self.classify(query, context);
        let decision = self.decide(classification);
        tracing::info!(
            "Routed query as {} ({:?}, confidence {:.2}) via {}",
            decision.classification.query_type,
            decision.classification.complexity,
            decision.classification.confidence,
            decision.route
        );
        decision
    }

    /// Decision used when classification failed or timed out
    pub fn conservative(&self) -> RoutingDecision {
        self.decide(Classification::conservative())
    }

    fn decide(&self, classification: Classification) -> RoutingDecision {
        let route = Self::route_for(&classification);
        let strategy = self.strategy_for(&classification);
        self.with_stats(|s| {
            s.total_queries += 1;
            *s.by_type.entry(classification.query_type).or_insert(0) += 1;
            *s.by_route.entry(route).or_insert(0) += 1;
            match classification.complexity {
                Complexity::Simple => s.simple_queries += 1,
                Complexity::Complex => s.complex_queries += 1,
            }
        });
        RoutingDecision {
            classification,
            route,
            strategy,
        }
    }

    pub fn record_decomposition(&self) {
        self.with_stats(|s| s.decompositions += 1);
    }

    pub fn stats(&self) -> RoutingStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn with_stats(&self, f: impl FnOnce(&mut RoutingStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}

fn scale_k(base_k: usize, configured: usize) -> usize {
    ((base_k * configured + BASE_TOP_K_FINAL / 2) / BASE_TOP_K_FINAL).max(1)
}
