use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for quarry
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Query rejected before the pipeline started
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    /// No candidate survived retrieval
    #[error("No relevant evidence found: {reason}")]
    NoResults { reason: NoResultsReason },

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Chunk store errors
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Index errors outside of the degradable search path
    #[error("Index error: {0}")]
    Index(#[from] crate::index::IndexError),

    /// Embedding model errors outside of the degradable search path
    #[error("Embedding error: {0}")]
    Embedding(#[from] crate::embedding::EmbeddingError),

    /// Feedback log errors
    #[error("Feedback error: {0}")]
    Feedback(#[from] crate::feedback::FeedbackError),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QuarryError {
    /// True when the query ran but nothing came back, as opposed to a broken system
    pub fn is_no_results(&self) -> bool {
        matches!(self, QuarryError::NoResults { .. })
    }

    /// True for errors caused by the caller's input
    pub fn is_invalid_query(&self) -> bool {
        matches!(self, QuarryError::InvalidQuery { .. })
    }
}

/// Why a query produced no results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoResultsReason {
    /// Backends answered but nothing matched (or the filter removed everything)
    NothingMatched,
    /// Neither the keyword nor the vector backend produced a result list
    BackendsUnavailable,
}

impl std::fmt::Display for NoResultsReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoResultsReason::NothingMatched => write!(f, "nothing matched the query"),
            NoResultsReason::BackendsUnavailable => {
                write!(f, "keyword and vector backends are both unavailable")
            }
        }
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_results_is_distinct_from_system_errors() {
        let nothing = QuarryError::NoResults {
            reason: NoResultsReason::NothingMatched,
        };
        let broken = QuarryError::Config("bad".to_string());

        assert!(nothing.is_no_results());
        assert!(!broken.is_no_results());
        assert!(nothing.to_string().contains("nothing matched"));
    }

    #[test]
    fn test_invalid_query_display() {
        let err = QuarryError::InvalidQuery {
            reason: "query is empty".to_string(),
        };
        assert!(err.is_invalid_query());
        assert_eq!(err.to_string(), "Invalid query: query is empty");
    }
}
