//! Query classification, routing and decomposition
//!
//! Everything here runs before retrieval. Classification is a pure function
//! of the query text and the conversation context; an [`AmbiguityResolver`]
//! is consulted only when the rules are not confident.

mod classifier;
mod decomposer;
mod llm;
mod resolver;
mod router;

pub use classifier::{Classification, Complexity, QueryClassifier};
pub use decomposer::{
    Decomposition, DecompositionError, DecompositionMethod, LlmSplitter, QueryDecomposer, SubQuery,
};
pub use llm::{LanguageModel, LlmError};
pub use resolver::{AmbiguityResolver, LlmAssistedResolver, RuleBasedResolver};
pub use router::{
    CompressionAggressiveness, QueryRouter, Route, RoutingDecision, RoutingStats, Strategy,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Invalid classifier pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("Resolver returned an unknown label: {0}")]
    UnknownLabel(String),

    #[error("Language model error: {0}")]
    Llm(#[from] LlmError),
}

/// What kind of question is being asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Factual,
    Comparative,
    Analytical,
    Exploratory,
    MultiHop,
    Conversational,
}

impl QueryType {
    pub const ALL: [QueryType; 6] = [
        QueryType::Factual,
        QueryType::Comparative,
        QueryType::Analytical,
        QueryType::Exploratory,
        QueryType::MultiHop,
        QueryType::Conversational,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Factual => "factual",
            QueryType::Comparative => "comparative",
            QueryType::Analytical => "analytical",
            QueryType::Exploratory => "exploratory",
            QueryType::MultiHop => "multi_hop",
            QueryType::Conversational => "conversational",
        }
    }

    /// Parse a label as written by a person or a model ("multi-hop", "Summarization")
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
            .replace(['-', ' '], "_");
        match normalized.as_str() {
            "factual" => Some(QueryType::Factual),
            "comparative" | "comparison" => Some(QueryType::Comparative),
            "analytical" | "analysis" => Some(QueryType::Analytical),
            "exploratory" | "summarization" | "summary" => Some(QueryType::Exploratory),
            "multi_hop" | "multihop" => Some(QueryType::MultiHop),
            "conversational" => Some(QueryType::Conversational),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_type_labels() {
        for t in QueryType::ALL {
            assert_eq!(QueryType::from_label(t.as_str()), Some(t));
        }
        assert_eq!(QueryType::from_label("Multi-Hop."), Some(QueryType::MultiHop));
        assert_eq!(QueryType::from_label(" summarization"), Some(QueryType::Exploratory));
        assert_eq!(QueryType::from_label("poetry"), None);
    }

    #[test]
    fn test_query_type_serde() {
        assert_eq!(serde_json::to_string(&QueryType::MultiHop).unwrap(), "\"multi_hop\"");
    }
}
