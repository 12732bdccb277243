//! Second opinion for low-confidence classifications

use crate::routing::{Classification, ClassifyError, LanguageModel, QueryType};
use std::sync::Arc;

const RESOLVED_CONFIDENCE: f32 = 0.6;
const LLM_MAX_TOKENS: usize = 8;

/// Consulted when rule confidence falls below the ambiguity threshold
///
/// Implementations may block; the router calls them from the blocking pool.
pub trait AmbiguityResolver: Send + Sync {
    fn resolve(&self, query: &str, rules: &Classification) -> Result<Classification, ClassifyError>;

    fn name(&self) -> &str;
}

/// Decides by the leading interrogative or imperative
pub struct RuleBasedResolver;

impl RuleBasedResolver {
    fn lead_type(query: &str) -> Option<QueryType> {
        let lowered = query.trim().to_lowercase();
        let first = lowered
            .split_whitespace()
            .next()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))?;

        match first {
            "who" | "what" | "when" | "where" | "which" => Some(QueryType::Factual),
            "why" | "how" | "explain" => Some(QueryType::Analytical),
            "compare" | "contrast" => Some(QueryType::Comparative),
            "summarize" | "summarise" | "describe" | "list" | "overview" => {
                Some(QueryType::Exploratory)
            }
            "tell" if lowered.starts_with("tell me about") => Some(QueryType::Exploratory),
            _ => None,
        }
    }
}

impl AmbiguityResolver for RuleBasedResolver {
    fn resolve(&self, query: &str, rules: &Classification) -> Result<Classification, ClassifyError> {
        let mut resolved = rules.clone();
        if let Some(lead) = Self::lead_type(query) {
            // Cue phrases beat the lead word when they found a different type
            let rules_matched = rules.score_for(rules.query_type) > 0;
            if !rules_matched || lead == rules.query_type {
                resolved.query_type = lead;
                resolved.confidence = rules.confidence.max(RESOLVED_CONFIDENCE);
                resolved.resolved_by = Some(self.name().to_string());
            }
        }
        Ok(resolved)
    }

    fn name(&self) -> &str {
        "rules"
    }
}

/// Asks a language model for a single type label
pub struct LlmAssistedResolver {
    model: Arc<dyn LanguageModel>,
}

impl LlmAssistedResolver {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    fn prompt(query: &str) -> String {
        let labels: Vec<&str> = QueryType::ALL.iter().map(|t| t.as_str()).collect();
        format!(
            "Classify the question into exactly one of: {}.\nAnswer with the label only.\n\nQuestion: {}\nLabel:",
            labels.join(", "),
            query
        )
    }
}

impl AmbiguityResolver for LlmAssistedResolver {
    fn resolve(&self, query: &str, rules: &Classification) -> Result<Classification, ClassifyError> {
        let answer = self.model.complete(&Self::prompt(query), LLM_MAX_TOKENS)?;
        let query_type = answer
            .split(|c: char| c.is_whitespace() || c == ',')
            .find_map(QueryType::from_label)
            .ok_or_else(|| ClassifyError::UnknownLabel(answer.trim().to_string()))?;

        let mut resolved = rules.clone();
        resolved.query_type = query_type;
        resolved.confidence = rules.confidence.max(RESOLVED_CONFIDENCE);
        resolved.resolved_by = Some(format!("llm:{}", self.model.model_name()));
        Ok(resolved)
    }

    fn name(&self) -> &str {
        "llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{LlmError, QueryClassifier};

    struct CannedModel(&'static str);

    impl LanguageModel for CannedModel {
        fn complete(&self, _prompt: &str, _max_tokens: usize) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[test]
    fn test_rule_resolver_uses_lead_word_when_no_cue_matched() {
        let rules = QueryClassifier::new().unwrap().classify("Describe Ayodhya", None);
        assert_eq!(rules.query_type, QueryType::Factual);

        let resolved = RuleBasedResolver.resolve("Describe Ayodhya", &rules).unwrap();
        assert_eq!(resolved.query_type, QueryType::Exploratory);
        assert_eq!(resolved.resolved_by.as_deref(), Some("rules"));
    }

    #[test]
    fn test_rule_resolver_keeps_matched_cue() {
        let rules = QueryClassifier::new()
            .unwrap()
            .classify("Why did the war happen, compare the sides", None);
        let resolved = RuleBasedResolver
            .resolve("Why did the war happen, compare the sides", &rules)
            .unwrap();
        assert_eq!(resolved.query_type, rules.query_type);
    }

    #[test]
    fn test_llm_resolver_parses_label() {
        let resolver = LlmAssistedResolver::new(Arc::new(CannedModel(" Multi-hop\n")));
        let rules = Classification::conservative();
        let resolved = resolver.resolve("anything", &rules).unwrap();
        assert_eq!(resolved.query_type, QueryType::MultiHop);
        assert_eq!(resolved.resolved_by.as_deref(), Some("llm:canned"));
    }

    #[test]
    fn test_llm_resolver_rejects_unknown_label() {
        let resolver = LlmAssistedResolver::new(Arc::new(CannedModel("banana")));
        let err = resolver.resolve("anything", &Classification::conservative()).unwrap_err();
        assert!(matches!(err, ClassifyError::UnknownLabel(_)));
    }
}
