//! Splits comparative and multi-part questions into independent sub-queries

use crate::routing::{LanguageModel, LlmError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const MIN_SUB_QUERIES: usize = 2;
const LLM_MAX_TOKENS: usize = 300;
const MIN_LLM_LINE_CHARS: usize = 10;

#[derive(Error, Debug)]
pub enum DecompositionError {
    #[error("Invalid decomposition pattern: {0}")]
    Pattern(String),

    #[error("No rule produced sub-queries")]
    NoRuleMatched,

    #[error("Only {0} usable sub-queries")]
    TooFewSubQueries(usize),

    #[error("Language model split failed: {0}")]
    Llm(#[from] LlmError),
}

impl DecompositionError {
    /// The query is simply not splittable, as opposed to a splitter failure
    pub fn is_not_decomposable(&self) -> bool {
        matches!(self, Self::NoRuleMatched | Self::TooFewSubQueries(_))
    }
}

/// One independent piece of a decomposed query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuery {
    pub text: String,
    /// Id of the request this was split from
    pub parent_query_id: Uuid,
    /// Position in the split; results merge in this order
    pub order: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "rule", rename_all = "snake_case")]
pub enum DecompositionMethod {
    Rule(String),
    Llm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub parent_query_id: Uuid,
    pub sub_queries: Vec<SubQuery>,
    pub method: DecompositionMethod,
}

/// Asks a language model for one sub-question per line
pub struct LlmSplitter {
    model: Arc<dyn LanguageModel>,
}

impl LlmSplitter {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub fn split(&self, query: &str) -> Result<Vec<String>, LlmError> {
        let prompt = format!(
            "Break down this question into simpler sub-questions that can be answered independently.\n\
             Each sub-question should cover one aspect of the original.\n\n\
             Question: {}\n\n\
             Give 2-4 sub-questions, one per line, without numbering.\n\nSub-questions:",
            query
        );
        let answer = self.model.complete(&prompt, LLM_MAX_TOKENS)?;

        let lines: Vec<String> = answer
            .lines()
            .map(|l| {
                l.trim()
                    .trim_start_matches(|c: char| {
                        c.is_ascii_digit() || matches!(c, '.' | '-' | '*' | ')' | '•' | ' ')
                    })
                    .trim()
                    .to_string()
            })
            .filter(|l| l.chars().count() > MIN_LLM_LINE_CHARS)
            .map(|l| if l.ends_with('?') { l } else { format!("{}?", l) })
            .collect();

        if lines.is_empty() {
            return Err(LlmError::InvalidResponse(
                "no sub-questions in response".to_string(),
            ));
        }
        Ok(lines)
    }
}

struct Rules {
    compare: Regex,
    difference: Regex,
    versus: Regex,
    how_did_cause: Regex,
    what_caused: Regex,
    resulted_in: Regex,
    and_split: Regex,
}

impl Rules {
    fn compile() -> Result<Self, DecompositionError> {
        let re = |p: &str| Regex::new(p).map_err(|e| DecompositionError::Pattern(e.to_string()));
        Ok(Self {
            compare: re(r"(?i)\bcompare\s+(.+?)\s+(?:and|with|to)\s+(.+)")?,
            difference: re(r"(?i)\bdifferences?\s+between\s+(.+?)\s+and\s+(.+)")?,
            versus: re(r"(?i)^(.+?)\s+(?:vs\.?|versus)\s+(.+)$")?,
            how_did_cause: re(r"(?i)\bhow\s+did\s+(.+?)\s+(cause|lead\s+to)\s+(.+)")?,
            what_caused: re(r"(?i)\bwhat\s+caused\s+(.+)")?,
            resulted_in: re(r"(?i)^(.+?)\s+resulted\s+in\s+(.+)$")?,
            and_split: re(r"(?i)\s+and\s+")?,
        })
    }

    /// First matching rule wins
    fn apply(&self, query: &str) -> Option<(&'static str, Vec<String>)> {
        if let Some(c) = self.compare.captures(query) {
            let (x, y) = (clean(&c[1]), clean(&c[2]));
            return Some(("compare", vec![format!("What is {}?", x), format!("What is {}?", y)]));
        }
        if let Some(c) = self.difference.captures(query) {
            let (x, y) = (clean(&c[1]), clean(&c[2]));
            return Some(("difference", vec![format!("Describe {}", x), format!("Describe {}", y)]));
        }
        if let Some(c) = self.versus.captures(query) {
            let (x, y) = (clean(&c[1]), clean(&c[2]));
            return Some(("versus", vec![format!("What is {}?", x), format!("What is {}?", y)]));
        }
        if let Some(c) = self.how_did_cause.captures(query) {
            let (x, verb, y) = (clean(&c[1]), c[2].to_lowercase(), clean(&c[3]));
            return Some((
                "cause_effect",
                vec![
                    format!("What is {}?", x),
                    format!("What is {}?", y),
                    format!("How did {} {} {}?", x, verb, y),
                ],
            ));
        }
        if let Some(c) = self.what_caused.captures(query) {
            let x = clean(&c[1]);
            return Some((
                "cause_effect",
                vec![
                    format!("What is {}?", x),
                    format!("What happened before {}?", x),
                    format!("What caused {}?", x),
                ],
            ));
        }
        if let Some(c) = self.resulted_in.captures(query) {
            let (x, y) = (clean(&c[1]), clean(&c[2]));
            return Some((
                "cause_effect",
                vec![
                    format!("What is {}?", x),
                    format!("What is {}?", y),
                    format!("How did {} result in {}?", x, y),
                ],
            ));
        }
        if query.contains('?') && self.and_split.is_match(query) {
            let parts: Vec<String> = self
                .and_split
                .split(query)
                .map(clean)
                .filter(|p| !p.is_empty())
                .map(|p| format!("{}?", capitalize(&p)))
                .collect();
            if parts.len() >= MIN_SUB_QUERIES {
                return Some(("and_split", parts));
            }
        }
        if query.matches('?').count() >= MIN_SUB_QUERIES {
            let parts: Vec<String> = query
                .split('?')
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(|p| format!("{}?", capitalize(p)))
                .collect();
            if parts.len() >= MIN_SUB_QUERIES {
                return Some(("question_split", parts));
            }
        }
        None
    }
}

pub struct QueryDecomposer {
    rules: Rules,
    max_sub_queries: usize,
    splitter: Option<LlmSplitter>,
}

impl QueryDecomposer {
    pub fn new(max_sub_queries: usize) -> Result<Self, DecompositionError> {
        Ok(Self {
            rules: Rules::compile()?,
            max_sub_queries,
            splitter: None,
        })
    }

    /// Consult a language model when no rule matches
    pub fn with_splitter(mut self, splitter: LlmSplitter) -> Self {
        self.splitter = Some(splitter);
        self
    }

    /// Split `query` into 2..=max_sub_queries sub-queries
    ///
    /// Duplicates are removed case-insensitively; anything that leaves fewer
    /// than two sub-queries is an error the caller falls back from.
    pub fn decompose(&self, query: &str, parent_query_id: Uuid) -> Result<Decomposition, DecompositionError> {
        let (method, texts) = match self.rules.apply(query) {
            Some((rule, texts)) => (DecompositionMethod::Rule(rule.to_string()), texts),
            None => match &self.splitter {
                Some(splitter) => (DecompositionMethod::Llm, splitter.split(query)?),
                None => return Err(DecompositionError::NoRuleMatched),
            },
        };

        let mut seen = ahash::AHashSet::new();
        let sub_queries: Vec<SubQuery> = texts
            .into_iter()
            .filter(|t| seen.insert(t.to_lowercase()))
            .take(self.max_sub_queries)
            .enumerate()
            .map(|(order, text)| SubQuery {
                text,
                parent_query_id,
                order,
            })
            .collect();

        if sub_queries.len() < MIN_SUB_QUERIES {
            return Err(DecompositionError::TooFewSubQueries(sub_queries.len()));
        }

        tracing::debug!(
            "Decomposed query into {} sub-queries ({:?})",
            sub_queries.len(),
            method
        );
        Ok(Decomposition {
            parent_query_id,
            sub_queries,
            method,
        })
    }
}

fn clean(s: &str) -> String {
    s.trim()
        .trim_end_matches(|c: char| matches!(c, '?' | '.' | '!' | ',') || c.is_whitespace())
        .to_string()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decomposer() -> QueryDecomposer {
        QueryDecomposer::new(3).unwrap()
    }

    fn texts(d: &Decomposition) -> Vec<&str> {
        d.sub_queries.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn test_compare_rule() {
        let parent = Uuid::new_v4();
        let d = decomposer().decompose("Compare Rama and Ravana", parent).unwrap();
        assert_eq!(texts(&d), vec!["What is Rama?", "What is Ravana?"]);
        assert_eq!(d.method, DecompositionMethod::Rule("compare".to_string()));
        assert!(d.sub_queries.iter().all(|s| s.parent_query_id == parent));
        assert_eq!(d.sub_queries[1].order, 1);
    }

    #[test]
    fn test_compare_with_and_versus() {
        let d = decomposer()
            .decompose("compare the Ramayana with the Mahabharata?", Uuid::new_v4())
            .unwrap();
        assert_eq!(texts(&d), vec!["What is the Ramayana?", "What is the Mahabharata?"]);

        let d = decomposer().decompose("Rama vs Ravana", Uuid::new_v4()).unwrap();
        assert_eq!(texts(&d), vec!["What is Rama?", "What is Ravana?"]);
    }

    #[test]
    fn test_difference_rule() {
        let d = decomposer()
            .decompose("What are the differences between Vali and Sugriva?", Uuid::new_v4())
            .unwrap();
        assert_eq!(texts(&d), vec!["Describe Vali", "Describe Sugriva"]);
    }

    #[test]
    fn test_cause_effect_rule() {
        let d = decomposer()
            .decompose("How did the exile lead to the war?", Uuid::new_v4())
            .unwrap();
        assert_eq!(
            texts(&d),
            vec![
                "What is the exile?",
                "What is the war?",
                "How did the exile lead to the war?"
            ]
        );
    }

    #[test]
    fn test_and_split_and_question_split() {
        let d = decomposer()
            .decompose("Who is Rama and who is Sita?", Uuid::new_v4())
            .unwrap();
        assert_eq!(texts(&d), vec!["Who is Rama?", "Who is Sita?"]);

        let d = decomposer()
            .decompose("Where is Lanka? Who ruled it? When did it burn?", Uuid::new_v4())
            .unwrap();
        assert_eq!(
            texts(&d),
            vec!["Where is Lanka?", "Who ruled it?", "When did it burn?"]
        );
    }

    #[test]
    fn test_caps_at_max() {
        let d = QueryDecomposer::new(2)
            .unwrap()
            .decompose("A one? B two? C three?", Uuid::new_v4())
            .unwrap();
        assert_eq!(d.sub_queries.len(), 2);
    }

    #[test]
    fn test_no_rule_is_an_error() {
        let err = decomposer().decompose("Who is Rama?", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DecompositionError::NoRuleMatched));

        // Both halves identical after dedup
        let err = decomposer().decompose("Compare Rama and rama", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DecompositionError::TooFewSubQueries(1)));
        assert!(err.is_not_decomposable());
    }

    struct LinesModel;

    impl LanguageModel for LinesModel {
        fn complete(&self, _prompt: &str, _max_tokens: usize) -> Result<String, LlmError> {
            Ok("1. Who was the king of Ayodhya\n2. Why was Rama exiled?\nok".to_string())
        }

        fn model_name(&self) -> &str {
            "lines"
        }
    }

    #[test]
    fn test_llm_splitter_fallback() {
        let d = decomposer()
            .with_splitter(LlmSplitter::new(Arc::new(LinesModel)))
            .decompose("Tell me the story of the exile", Uuid::new_v4())
            .unwrap();
        assert_eq!(d.method, DecompositionMethod::Llm);
        assert_eq!(
            texts(&d),
            vec!["Who was the king of Ayodhya?", "Why was Rama exiled?"]
        );
    }

    struct OfflineModel;

    impl LanguageModel for OfflineModel {
        fn complete(&self, _prompt: &str, _max_tokens: usize) -> Result<String, LlmError> {
            Err(LlmError::Unavailable("connection refused".to_string()))
        }

        fn model_name(&self) -> &str {
            "offline"
        }
    }

    #[test]
    fn test_splitter_failure_is_a_real_error() {
        let err = decomposer()
            .with_splitter(LlmSplitter::new(Arc::new(OfflineModel)))
            .decompose("Tell me the story of the exile", Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, DecompositionError::Llm(_)));
        assert!(!err.is_not_decomposable());
    }
}
