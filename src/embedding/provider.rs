//! Embedding provider trait and FastEmbed implementation

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Embedding generation failed: {0}")]
    GenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Embedding service used for the query vector and sentence scoring
///
/// Calls are synchronous; the pipeline runs them on the blocking pool under a
/// timeout.
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Generate embeddings for multiple texts, one vector per input in input order
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Local models the provider knows how to load: (name, fastembed model, dimension)
fn supported_model(name: &str) -> Option<(EmbeddingModel, usize)> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" => Some((EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Some((EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Some((EmbeddingModel::BGEBaseENV15, 768)),
        _ => None,
    }
}

/// FastEmbed provider for local embedding generation
///
/// The query embedding must come from the same model that embedded the corpus,
/// so the configured dimension is checked against the model's.
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
    model_name: String,
    dimension: usize,
}

impl FastEmbedProvider {
    /// Create a new FastEmbed provider with the specified model
    ///
    /// Models are downloaded to `~/.cache/huggingface/` on first use.
    pub fn new(model_name: &str) -> Result<Self, EmbeddingError> {
        let (embedding_model, dimension) = supported_model(model_name).ok_or_else(|| {
            EmbeddingError::InitializationError(format!(
                "Unsupported model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5",
                model_name
            ))
        })?;

        tracing::info!("Initializing embedding model: {} ({}D)", model_name, dimension);

        let init_options = InitOptions::new(embedding_model).with_show_download_progress(true);

        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
            dimension,
        })
    }

    /// Create provider with default model (all-MiniLM-L6-v2)
    pub fn with_default_model() -> Result<Self, EmbeddingError> {
        Self::new("all-MiniLM-L6-v2")
    }

    /// Create a provider and check it produces vectors of the indexed dimension
    pub fn for_index(model_name: &str, index_dimension: usize) -> Result<Self, EmbeddingError> {
        let provider = Self::new(model_name)?;
        if provider.dimension != index_dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: index_dimension,
                actual: provider.dimension,
            });
        }
        Ok(provider)
    }
}

impl FastEmbedProvider {
    fn check_dimension(&self, embedding: &[f32]) -> Result<(), EmbeddingError> {
        if embedding.len() == self.dimension {
            Ok(())
        } else {
            Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            })
        }
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
        }
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| EmbeddingError::GenerationError("No embedding generated".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        // An empty member would shift the output alignment
        if let Some(pos) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput(format!(
                "Batch item {} is empty",
                pos
            )));
        }

        let embeddings = self
            .model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;
        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::GenerationError(format!(
                "{} texts produced {} embeddings",
                texts.len(),
                embeddings.len()
            )));
        }
        for embedding in &embeddings {
            self.check_dimension(embedding)?;
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn test_supported_model_lookup() {
        assert_eq!(supported_model("all-MiniLM-L6-v2").map(|m| m.1), Some(384));
        assert_eq!(supported_model("BGE-BASE-EN-V1.5").map(|m| m.1), Some(768));
        assert!(supported_model("text-embedding-3-large").is_none());
        assert!(FastEmbedProvider::new("unknown-model").is_err());
    }

    #[test]
    #[ignore] // Downloads the model on first run
    fn test_for_index_rejects_wrong_dimension() {
        assert!(matches!(
            FastEmbedProvider::for_index("all-MiniLM-L6-v2", 768),
            Err(EmbeddingError::DimensionMismatch { expected: 768, actual: 384 })
        ));
    }

    #[test]
    #[ignore] // Downloads the model on first run
    fn test_embeddings_are_aligned_and_comparable() {
        let provider = FastEmbedProvider::with_default_model().unwrap();
        let texts = vec![
            "Rama was the prince of Ayodhya.".to_string(),
            "Rama ruled the kingdom of Ayodhya.".to_string(),
            "The monsoon arrives in June.".to_string(),
        ];
        let embeddings = provider.embed_batch(&texts).unwrap();
        assert_eq!(embeddings.len(), 3);
        assert!(embeddings.iter().all(|e| e.len() == 384));

        let related = cosine_similarity(&embeddings[0], &embeddings[1]);
        let unrelated = cosine_similarity(&embeddings[0], &embeddings[2]);
        assert!(related > unrelated);

        let single = provider.embed(&texts[0]).unwrap();
        assert!(cosine_similarity(&single, &embeddings[0]) > 0.99);
    }

    #[test]
    #[ignore] // Downloads the model on first run
    fn test_empty_input_rejected() {
        let provider = FastEmbedProvider::with_default_model().unwrap();
        assert!(provider.embed("").is_err());
        let texts = vec!["Rama".to_string(), "   ".to_string()];
        assert!(provider.embed_batch(&texts).is_err());
        assert!(provider.embed_batch(&[]).unwrap().is_empty());
    }
}
