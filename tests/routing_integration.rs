//! Classification, routing and decomposition over realistic questions

use quarry::clock::SystemClock;
use quarry::config::{FeedbackConfig, RetrievalConfig, RoutingConfig};
use quarry::feedback::{FeedbackCollector, FeedbackInput};
use quarry::routing::{QueryDecomposer, QueryRouter, QueryType, Route};
use std::sync::Arc;
use uuid::Uuid;

fn router() -> QueryRouter {
    QueryRouter::new(&RoutingConfig::default(), &RetrievalConfig::default()).unwrap()
}

#[test]
fn test_routes_by_query_type() {
    let cases = [
        ("Who was Ravana?", QueryType::Factual, Route::FastFactual),
        ("Compare the reign of Rama with Ravana", QueryType::Comparative, Route::ComparativeAnalysis),
        ("Why did Ravana abduct Sita?", QueryType::Analytical, Route::DeepAnalysis),
        ("Summarize the Ramayana", QueryType::Exploratory, Route::ExploratoryOverview),
        (
            "The bridge was built and then what happened next?",
            QueryType::MultiHop,
            Route::MultiHopReasoning,
        ),
        ("Tell me more about the battle", QueryType::Conversational, Route::Conversational),
    ];

    let router = router();
    for (query, query_type, route) in cases {
        let decision = router.route(query, None);
        assert_eq!(decision.classification.query_type, query_type, "query: {}", query);
        assert_eq!(decision.route, route, "query: {}", query);
    }

    let stats = router.stats();
    assert_eq!(stats.total_queries, 6);
    assert_eq!(stats.by_route.values().sum::<u64>(), 6);
}

#[test]
fn test_classification_is_deterministic() {
    let queries = [
        "Who is Rama?",
        "Compare Rama and Ravana",
        "Why did the war begin, and who started it, and how did it end?",
        "give me an overview of the Sundara Kanda",
        "quantum chromodynamics",
    ];

    let first = router();
    let second = router();
    for query in queries {
        let a = first.classify(query, None);
        for _ in 0..5 {
            assert_eq!(first.classify(query, None), a);
        }
        assert_eq!(second.classify(query, None), a);
    }
}

#[test]
fn test_exploratory_strategy_is_wider_than_factual() {
    let router = router();
    let factual = router.route("Who is Rama?", None).strategy;
    let exploratory = router.route("Summarize the Ramayana", None).strategy;

    assert_eq!(factual.top_k_final, 5);
    assert_eq!(exploratory.top_k_final, 15);
    assert!(exploratory.top_k_initial >= exploratory.top_k_final);
    assert!(!factual.decompose);
}

#[test]
fn test_decomposition_recall() {
    let decomposer = QueryDecomposer::new(3).unwrap();
    let decomposable = [
        "Compare Rama and Ravana",
        "What are the differences between Ayodhya and Lanka?",
        "Rama vs Ravana",
        "How did the abduction of Sita lead to the war?",
        "What caused the war in Lanka?",
        "Who is Rama and who is Sita?",
        "Who is Rama? Who is Hanuman?",
    ];

    for query in decomposable {
        let parent = Uuid::new_v4();
        let decomposition = decomposer
            .decompose(query, parent)
            .unwrap_or_else(|e| panic!("'{}' was not decomposed: {}", query, e));
        let n = decomposition.sub_queries.len();
        assert!((2..=3).contains(&n), "'{}' gave {} sub-queries", query, n);
        for (i, sub) in decomposition.sub_queries.iter().enumerate() {
            assert_eq!(sub.order, i);
            assert_eq!(sub.parent_query_id, parent);
            assert!(!sub.text.trim().is_empty());
        }
    }

    assert!(decomposer.decompose("Who is Rama?", Uuid::new_v4()).is_err());
}

#[test]
fn test_feedback_aggregates_by_route() {
    let router = router();
    let collector = FeedbackCollector::new(&FeedbackConfig::default(), Arc::new(SystemClock));

    let ratings = [("Who is Rama?", 5), ("Who was Sita?", 4), ("Summarize the Ramayana", 1)];
    for (query, rating) in ratings {
        let decision = router.route(query, None);
        collector
            .record(
                FeedbackInput::new(query, Uuid::new_v4(), rating)
                    .with_routing(decision.classification.query_type, decision.route),
            )
            .unwrap();
    }

    let stats = collector.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_route["fast_factual"].count, 2);
    assert!((stats.by_route["fast_factual"].average - 4.5).abs() < 1e-9);
    assert_eq!(stats.by_query_type["exploratory"].count, 1);
    assert_eq!(collector.low_rated(5)[0].query, "Summarize the Ramayana");
}
