//! Quote-level evidence and context budgeting
//!
//! - [`EvidenceExtractor`] picks the sentences of each surviving chunk that
//!   best match the query
//! - [`ContextCompressor`] trims the selected sentences to a character budget

mod compressor;
mod extractor;
mod sentences;

pub use compressor::{CompressionStats, ContextCompressor};
pub use extractor::{EvidenceExtractor, EvidenceOutcome, SentenceScoring};
pub use sentences::{cut_point, split_sentences, SentenceSplitter};

use crate::storage::ChunkId;
use serde::{Deserialize, Serialize};

/// One quoted sentence with the chunk it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSentence {
    pub chunk_id: ChunkId,
    pub source_file: String,
    pub page: u32,
    pub text: String,
    /// Similarity to the query (cosine, or token overlap in lexical mode)
    pub score: f32,
    /// Index of the sentence within its chunk
    pub position: usize,
    /// Chosen because nothing in the chunk cleared the threshold
    pub fallback: bool,
    /// Cut short by the compressor
    pub truncated: bool,
}

impl EvidenceSentence {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Total characters across evidence sentences
pub fn total_chars(sentences: &[EvidenceSentence]) -> usize {
    sentences.iter().map(|s| s.char_len()).sum()
}
