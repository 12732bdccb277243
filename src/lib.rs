//! Quarry - hybrid retrieval and ranking core
//!
//! Given a natural-language query over a pre-indexed document corpus, quarry
//! fuses keyword and vector search, reranks, removes near-duplicates, extracts
//! query-relevant sentences and trims them to a character budget. Queries are
//! classified first so each kind gets its own retrieval strategy; comparative
//! and multi-part questions are split and answered piecewise. Answer
//! generation is left to the caller.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod embedding;
pub mod error;
pub mod evidence;
pub mod feedback;
pub mod index;
pub mod pipeline;
pub mod retrieval;
pub mod routing;
pub mod session;
pub mod storage;

pub use error::{QuarryError, Result};
pub use pipeline::{Pipeline, PipelineBuilder, QueryRequest, ResultBundle, SearchResponse};
