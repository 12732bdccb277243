//! Embedding collaborator and similarity helpers
//!
//! - [`EmbeddingProvider`] abstracts the embedding service (query and sentence vectors)
//! - [`FastEmbedProvider`] runs a local model (all-MiniLM-L6-v2, 384-dim)
//! - Similarity helpers shared by diversity ranking and evidence scoring

mod provider;

pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider};

use ahash::AHashSet;

/// Cosine similarity; 0.0 when either vector has no magnitude or lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Token-overlap (Jaccard) similarity over lowercased whitespace tokens
///
/// Used when embeddings are missing or the embedding service is down.
pub fn token_overlap(a: &str, b: &str) -> f32 {
    let left: AHashSet<String> = a.split_whitespace().map(normalize_token).collect();
    let right: AHashSet<String> = b.split_whitespace().map(normalize_token).collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f32 / union as f32
}

fn normalize_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_token_overlap() {
        assert!((token_overlap("Rama went home.", "rama went home") - 1.0).abs() < 1e-6);
        assert_eq!(token_overlap("alpha beta", "gamma delta"), 0.0);
        assert_eq!(token_overlap("", "anything"), 0.0);
        let partial = token_overlap("the king of Lanka", "the king of Ayodhya");
        assert!(partial > 0.0 && partial < 1.0);
    }
}
