//! Read-side adapters over the keyword and vector indexes
//!
//! Both backends answer `search(query, k)` with ranked [`CandidateRef`]s and
//! share no mutable state, so the pipeline can query them concurrently.
//! Persistent implementations wrap tantivy and hnsw_rs; the in-memory ones
//! serve small corpora and tests.

mod keyword_index;
mod memory;
mod vector_index;

pub use keyword_index::KeywordIndex;
pub use memory::{Bm25Index, FlatVectorIndex};
pub use vector_index::VectorIndex;

use crate::storage::ChunkId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index initialization failed: {0}")]
    InitializationError(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Insert failed: {0}")]
    InsertError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Query parsing error: {0}")]
    QueryParseError(String),

    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Tantivy error: {0}")]
    TantivyError(#[from] tantivy::TantivyError),
}

/// One ranked hit from a backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateRef {
    pub id: ChunkId,
    /// Backend-native score (BM25 or cosine similarity), higher is better
    pub score: f32,
}

impl CandidateRef {
    pub fn new(id: ChunkId, score: f32) -> Self {
        Self { id, score }
    }
}

/// Term lookup over chunk text
pub trait KeywordBackend: Send + Sync {
    /// Ranked hits for a free-text query, best first, at most `k`
    fn search(&self, query: &str, k: usize) -> Result<Vec<CandidateRef>, IndexError>;

    fn name(&self) -> &str {
        "keyword"
    }
}

/// Nearest-neighbour lookup over chunk embeddings
pub trait VectorBackend: Send + Sync {
    /// Ranked hits for a query embedding, best first, at most `k`
    fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<CandidateRef>, IndexError>;

    /// Embedding length the index was built with
    fn dimension(&self) -> usize;

    fn name(&self) -> &str {
        "vector"
    }
}
