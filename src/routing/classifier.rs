//! Rule-based query classification
//!
//! Each query type owns a table of cue phrases matched on word boundaries,
//! case-insensitively. The type with the most matching phrases wins; ties go
//! to the type listed first. A follow-up in an active conversation is always
//! conversational.

use crate::routing::{ClassifyError, QueryType};
use crate::session::ConversationContext;
use regex::Regex;
use serde::{Deserialize, Serialize};

const CONFIDENCE_PER_MATCH: f32 = 0.3;
const MAX_CONFIDENCE: f32 = 0.95;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const FOLLOW_UP_CONFIDENCE: f32 = 0.9;
const COMPLEX_WORD_COUNT: usize = 15;

const FACTUAL_CUES: &[&str] = &[
    "who is", "who was", "who were", "what is", "what was", "what are", "when did", "when was",
    "where is", "where was",
];

const COMPARATIVE_CUES: &[&str] = &[
    "compare",
    "difference between",
    "differences between",
    "similarities between",
    "versus",
    "vs",
    "contrast",
    "which is better",
];

const ANALYTICAL_CUES: &[&str] = &[
    "why did",
    "why is",
    "why was",
    "how did",
    "explain why",
    "what caused",
    "reason for",
    "because",
];

const EXPLORATORY_CUES: &[&str] = &[
    "summarize",
    "summary of",
    "overview of",
    "main points",
    "key takeaways",
    "brief",
    "in short",
];

const MULTI_HOP_CUES: &[&str] = &[
    "and then",
    "after that",
    "what happened next",
    "as a result",
    "consequently",
    "therefore",
];

const CONVERSATIONAL_CUES: &[&str] = &[
    "tell me more",
    "what about",
    "and what",
    "also",
    "additionally",
    "furthermore",
];

const COMPLEX_INDICATORS: &[&str] = &[
    "compare",
    "contrast",
    "analyze",
    "evaluate",
    "why",
    "how",
    "explain",
    "relationship between",
    "impact of",
    "consequence",
    "multiple",
    "several",
    "and",
    "or",
    "both",
];

const SIMPLE_INDICATORS: &[&str] = &[
    "who", "what", "when", "where", "which", "list", "name", "is", "was", "are",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Complex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub query_type: QueryType,
    pub confidence: f32,
    pub complexity: Complexity,
    /// Matching cue count per type, in table order
    pub scores: Vec<(QueryType, usize)>,
    /// Resolver that overrode the rules, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl Classification {
    /// Used when classification could not run at all
    pub fn conservative() -> Self {
        Self {
            query_type: QueryType::Factual,
            confidence: 0.0,
            complexity: Complexity::Simple,
            scores: Vec::new(),
            resolved_by: None,
        }
    }

    pub fn score_for(&self, query_type: QueryType) -> usize {
        self.scores
            .iter()
            .find(|(t, _)| *t == query_type)
            .map(|(_, s)| *s)
            .unwrap_or(0)
    }
}

/// Compiled cue tables
pub struct QueryClassifier {
    cues: Vec<(QueryType, Vec<Regex>)>,
    complex: Vec<Regex>,
    simple: Vec<Regex>,
}

impl QueryClassifier {
    pub fn new() -> Result<Self, ClassifyError> {
        let tables: [(QueryType, &[&str]); 6] = [
            (QueryType::Factual, FACTUAL_CUES),
            (QueryType::Comparative, COMPARATIVE_CUES),
            (QueryType::Analytical, ANALYTICAL_CUES),
            (QueryType::Exploratory, EXPLORATORY_CUES),
            (QueryType::MultiHop, MULTI_HOP_CUES),
            (QueryType::Conversational, CONVERSATIONAL_CUES),
        ];

        let mut cues = Vec::with_capacity(tables.len());
        for (query_type, phrases) in tables {
            cues.push((query_type, compile_all(phrases)?));
        }

        Ok(Self {
            cues,
            complex: compile_all(COMPLEX_INDICATORS)?,
            simple: compile_all(SIMPLE_INDICATORS)?,
        })
    }

    /// Classify `query`; identical input always gives identical output
    pub fn classify(&self, query: &str, context: Option<&ConversationContext>) -> Classification {
        let scores: Vec<(QueryType, usize)> = self
            .cues
            .iter()
            .map(|(t, patterns)| (*t, count_matches(patterns, query)))
            .collect();
        let complexity = self.complexity(query);

        if context.is_some_and(|c| c.has_history && c.is_follow_up) {
            return Classification {
                query_type: QueryType::Conversational,
                confidence: FOLLOW_UP_CONFIDENCE,
                complexity,
                scores,
                resolved_by: None,
            };
        }

        // First maximum wins
        let mut best: Option<(QueryType, usize)> = None;
        for (t, s) in &scores {
            if *s > 0 && best.map_or(true, |(_, b)| *s > b) {
                best = Some((*t, *s));
            }
        }

        let (query_type, confidence) = match best {
            Some((t, s)) => (t, (s as f32 * CONFIDENCE_PER_MATCH).min(MAX_CONFIDENCE)),
            None => (QueryType::Factual, DEFAULT_CONFIDENCE),
        };

        Classification {
            query_type,
            confidence,
            complexity,
            scores,
            resolved_by: None,
        }
    }

    pub fn complexity(&self, query: &str) -> Complexity {
        let word_count = query.split_whitespace().count();
        let commas = query.matches(',').count();
        if word_count > COMPLEX_WORD_COUNT || commas > 1 {
            return Complexity::Complex;
        }

        let complex = count_matches(&self.complex, query);
        let simple = count_matches(&self.simple, query);
        if complex > simple {
            Complexity::Complex
        } else {
            Complexity::Simple
        }
    }
}

fn compile_all(phrases: &[&str]) -> Result<Vec<Regex>, ClassifyError> {
    phrases
        .iter()
        .map(|phrase| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(phrase).replace(' ', r"\s+"));
            Regex::new(&pattern).map_err(|e| ClassifyError::Pattern {
                pattern: phrase.to_string(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Number of distinct cues present (not occurrences)
fn count_matches(patterns: &[Regex], text: &str) -> usize {
    patterns.iter().filter(|p| p.is_match(text)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> QueryClassifier {
        QueryClassifier::new().unwrap()
    }

    #[test]
    fn test_factual_simple() {
        let c = classifier().classify("Who is Rama?", None);
        assert_eq!(c.query_type, QueryType::Factual);
        assert_eq!(c.complexity, Complexity::Simple);
        assert!((c.confidence - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_comparative_complex() {
        let c = classifier().classify("Compare Rama and Ravana", None);
        assert_eq!(c.query_type, QueryType::Comparative);
        assert_eq!(c.complexity, Complexity::Complex);
    }

    #[test]
    fn test_word_boundaries() {
        let c = classifier();
        // "vs" inside "canvas" and "brief" inside "briefing" must not count
        let result = c.classify("Describe the canvas used in the briefing room", None);
        assert_eq!(result.score_for(QueryType::Comparative), 0);
        assert_eq!(result.score_for(QueryType::Exploratory), 0);

        let result = c.classify("Rama vs Ravana", None);
        assert_eq!(result.query_type, QueryType::Comparative);
    }

    #[test]
    fn test_analytical_and_exploratory() {
        let c = classifier();
        assert_eq!(
            c.classify("Why did Rama go into exile?", None).query_type,
            QueryType::Analytical
        );
        assert_eq!(
            c.classify("Summarize the main points of the Aranya Kanda", None).query_type,
            QueryType::Exploratory
        );
        assert_eq!(
            c.classify("What happened next, and then where did they go?", None).query_type,
            QueryType::MultiHop
        );
    }

    #[test]
    fn test_confidence_caps() {
        let c = classifier().classify(
            "compare the difference between and similarities between A versus B vs C, contrast, which is better",
            None,
        );
        assert_eq!(c.query_type, QueryType::Comparative);
        assert!((c.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_no_cue_defaults_to_factual() {
        let c = classifier().classify("Hanuman", None);
        assert_eq!(c.query_type, QueryType::Factual);
        assert!((c.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_follow_up_context_is_conversational() {
        let context = ConversationContext {
            has_history: true,
            is_follow_up: true,
            previous_queries: vec!["Who is Rama?".to_string()],
            previous_entities: vec!["Rama".to_string()],
        };
        let c = classifier().classify("Why did he leave?", Some(&context));
        assert_eq!(c.query_type, QueryType::Conversational);
        assert!((c.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_long_queries_are_complex() {
        let c = classifier();
        let long = "what is the name of the city where the king lived before the long war with the demons began";
        assert_eq!(c.complexity(long), Complexity::Complex);
        assert_eq!(c.complexity("Rama, Sita, Lakshmana"), Complexity::Complex);
        assert_eq!(c.complexity("Where is Lanka?"), Complexity::Simple);
    }

    #[test]
    fn test_deterministic() {
        let c = classifier();
        let q = "How did the exile of Rama lead to the war?";
        assert_eq!(c.classify(q, None), c.classify(q, None));
    }
}
