//! Language-model collaborator used for optional ambiguity resolution and splitting

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Language model unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Text completion service
///
/// Called synchronously; callers run it on the blocking pool under a timeout.
pub trait LanguageModel: Send + Sync {
    fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String, LlmError>;

    fn model_name(&self) -> &str;
}
