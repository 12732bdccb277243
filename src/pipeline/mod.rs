//! End-to-end query pipeline
//!
//! [`Pipeline::search`] turns a [`QueryRequest`] into a [`SearchResponse`]
//! holding a ranked, budgeted [`ResultBundle`].

mod bundle;
mod deadline;
mod orchestrator;
mod request;

pub use bundle::{
    CandidateTrace, DebugView, Degradation, PipelineStage, ResultBundle, RoutingMetadata,
    SearchResponse, SourceCitation, StageTiming,
};
pub use deadline::{call_blocking, CallFailure, Deadline};
pub use orchestrator::{Pipeline, PipelineBuilder};
pub use request::{normalize_query, validate_query, QueryRequest};
