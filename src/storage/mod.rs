//! Chunk metadata store
//!
//! Chunks are produced by the ingestion pipeline and are read-only here. The
//! retrieval path only hydrates ids returned by the indexes.

pub mod database;

pub use database::{ChunkDbStats, SqliteChunkStore};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable chunk identifier shared by both indexes and the store
pub type ChunkId = u64;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    #[error("Corrupt record for chunk {id}: {message}")]
    Corrupt { id: ChunkId, message: String },

    #[error("Chunk store unavailable: {0}")]
    Unavailable(String),
}

/// Immutable unit of retrievable text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub text: String,
    /// Embedding produced at ingestion time; empty when the store has none.
    /// Not written out with bundles.
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
    pub source_file: String,
    pub page: u32,
    pub chunk_index: u32,
}

impl Chunk {
    pub fn new(
        id: ChunkId,
        text: impl Into<String>,
        embedding: Vec<f32>,
        source_file: impl Into<String>,
        page: u32,
        chunk_index: u32,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            embedding,
            source_file: source_file.into(),
            page,
            chunk_index,
        }
    }

    /// `(source_file, page)` key used for page-level deduplication
    pub fn page_key(&self) -> (&str, u32) {
        (self.source_file.as_str(), self.page)
    }

    /// BLAKE3 digest of the chunk text
    pub fn content_hash(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}

/// Lookup of chunk bodies by id
pub trait ChunkStore: Send + Sync {
    /// Fetch the chunks that exist, in the order of `ids`; unknown ids are skipped
    fn get_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, StorageError>;

    fn len(&self) -> Result<usize, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

/// Hash-map backed store
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: AHashMap<ChunkId, Chunk>,
}

impl MemoryChunkStore {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            chunks: chunks.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }
}

impl ChunkStore for MemoryChunkStore {
    fn get_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, StorageError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.chunks.get(id).cloned())
            .collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_preserves_request_order() {
        let store = MemoryChunkStore::new(vec![
            Chunk::new(1, "one", vec![], "a.pdf", 1, 0),
            Chunk::new(2, "two", vec![], "a.pdf", 1, 1),
            Chunk::new(3, "three", vec![], "b.pdf", 4, 0),
        ]);

        let chunks = store.get_chunks(&[3, 99, 1]).unwrap();
        let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_page_key_and_hash() {
        let chunk = Chunk::new(7, "Rama", vec![], "ramayana.pdf", 12, 3);
        assert_eq!(chunk.page_key(), ("ramayana.pdf", 12));
        assert_eq!(chunk.content_hash().len(), 64);
        assert_eq!(
            chunk.content_hash(),
            Chunk::new(8, "Rama", vec![], "other.pdf", 1, 0).content_hash()
        );
    }
}
