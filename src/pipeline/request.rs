//! Incoming query requests and their validation

use crate::error::{QuarryError, Result};
use std::time::Duration;

/// One retrieval request
///
/// Everything except `text` is optional; unset fields fall back to the
/// pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub text: String,
    pub session_id: Option<String>,
    /// Case-insensitive substring of the source file name
    pub file_filter: Option<String>,
    /// Maximum evidence characters
    pub budget: Option<usize>,
    /// Force decomposition on or off
    pub decompose: Option<bool>,
    /// Overall time limit for this request
    pub deadline: Option<Duration>,
    /// Attach the per-candidate debug view to the response
    pub debug: bool,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_file_filter(mut self, filter: impl Into<String>) -> Self {
        self.file_filter = Some(filter.into());
        self
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_decompose(mut self, decompose: bool) -> Self {
        self.decompose = Some(decompose);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }
}

/// Trim and collapse runs of whitespace
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reject empty and over-long queries before any work is done
pub fn validate_query(normalized: &str, max_chars: usize) -> Result<()> {
    if normalized.is_empty() {
        return Err(QuarryError::InvalidQuery {
            reason: "query is empty".to_string(),
        });
    }
    let chars = normalized.chars().count();
    if chars > max_chars {
        return Err(QuarryError::InvalidQuery {
            reason: format!("query is {} characters, the limit is {}", chars, max_chars),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_query("  Who   is\tRama?\n"), "Who is Rama?");
        assert_eq!(normalize_query(" \n\t "), "");
    }

    #[test]
    fn test_validate() {
        assert!(validate_query("Who is Rama?", 2000).is_ok());
        assert!(validate_query("", 2000).unwrap_err().is_invalid_query());

        let long = "a".repeat(2001);
        let err = validate_query(&long, 2000).unwrap_err();
        assert!(err.to_string().contains("2001"));
    }

    #[test]
    fn test_builder() {
        let request = QueryRequest::new("q")
            .with_session("s")
            .with_file_filter("ramayana")
            .with_budget(100)
            .with_decompose(false)
            .with_debug();
        assert_eq!(request.session_id.as_deref(), Some("s"));
        assert_eq!(request.budget, Some(100));
        assert_eq!(request.decompose, Some(false));
        assert!(request.debug);
    }
}
