//! HNSW vector index over chunk embeddings

use crate::config::IndexingConfig;
use crate::index::{CandidateRef, IndexError, VectorBackend};
use crate::storage::{Chunk, ChunkId};
use hnsw_rs::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

const MAX_LAYERS: usize = 16;

/// HNSW vector index wrapper
///
/// Approximate nearest-neighbour search with cosine distance. The graph lives
/// in memory and is rebuilt from the chunk store at startup.
pub struct VectorIndex {
    index: RwLock<Hnsw<'static, f32, DistCosine>>,
    dimension: usize,
    ef_search: usize,
    count: AtomicU64,
}

impl VectorIndex {
    /// Create an empty index
    ///
    /// # Arguments
    /// * `dimension` - Vector dimension (must match the embedding model)
    /// * `capacity` - Expected number of vectors
    /// * `config` - HNSW construction and search parameters
    pub fn new(dimension: usize, capacity: usize, config: &IndexingConfig) -> Self {
        let index = Hnsw::<f32, DistCosine>::new(
            config.hnsw_m,
            capacity.max(1),
            MAX_LAYERS,
            config.hnsw_ef_construction,
            DistCosine,
        );

        Self {
            index: RwLock::new(index),
            dimension,
            ef_search: config.hnsw_ef_search,
            count: AtomicU64::new(0),
        }
    }

    /// Build an index from chunks carrying embeddings
    pub fn from_chunks(
        dimension: usize,
        chunks: &[Chunk],
        config: &IndexingConfig,
    ) -> Result<Self, IndexError> {
        let index = Self::new(dimension, chunks.len(), config);
        for chunk in chunks {
            index.insert(chunk.id, &chunk.embedding)?;
        }
        tracing::info!("Built vector index with {} vectors", index.len());
        Ok(index)
    }

    /// Insert a vector into the index
    pub fn insert(&self, id: ChunkId, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let data = vector.to_vec();
        let index = self
            .index
            .read()
            .map_err(|_| IndexError::InsertError("Index lock poisoned".to_string()))?;
        index.insert((&data, id as usize));
        self.count.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Get the number of vectors in the index
    pub fn len(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VectorBackend for VectorIndex {
    fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<CandidateRef>, IndexError> {
        if embedding.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let index = self
            .index
            .read()
            .map_err(|_| IndexError::SearchError("Index lock poisoned".to_string()))?;

        // ef must be at least k for HNSW to return k neighbours
        let neighbours = index.search(embedding, k, self.ef_search.max(k));

        let mut results: Vec<CandidateRef> = neighbours
            .into_iter()
            .map(|n| CandidateRef::new(n.d_id as ChunkId, 1.0 - n.distance))
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hnsw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: &[(usize, f32)]) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        for (i, x) in hot {
            v[*i] = *x;
        }
        v
    }

    #[test]
    fn test_index_creation() {
        let index = VectorIndex::new(384, 100, &IndexingConfig::default());
        assert_eq!(index.dimension(), 384);
        assert_eq!(index.len(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_and_search() {
        let index = VectorIndex::new(8, 10, &IndexingConfig::default());

        let vec1 = unit(8, &[(0, 1.0)]);
        let vec2 = unit(8, &[(1, 1.0)]);
        let vec3 = unit(8, &[(0, 0.9), (1, 0.1)]);

        index.insert(1, &vec1).unwrap();
        index.insert(2, &vec2).unwrap();
        index.insert(3, &vec3).unwrap();
        assert_eq!(index.len(), 3);

        let results = index.search(&vec1, 2).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].id == 1 || results[0].id == 3);
        assert!(results[0].score > 0.8);
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn test_from_chunks() {
        let chunks: Vec<Chunk> = (0..5u64)
            .map(|i| {
                Chunk::new(
                    i,
                    format!("chunk {}", i),
                    unit(4, &[((i % 4) as usize, 1.0)]),
                    "doc.pdf",
                    1,
                    i as u32,
                )
            })
            .collect();

        let index = VectorIndex::from_chunks(4, &chunks, &IndexingConfig::default()).unwrap();
        assert_eq!(index.len(), 5);

        let results = index.search(&unit(4, &[(2, 1.0)]), 1).unwrap();
        assert_eq!(results[0].id, 2);
    }

    #[test]
    fn test_dimension_validation() {
        let index = VectorIndex::new(384, 10, &IndexingConfig::default());
        assert!(matches!(
            index.insert(1, &[1.0; 128]),
            Err(IndexError::InvalidDimension { expected: 384, actual: 128 })
        ));
        assert!(index.search(&[1.0; 128], 3).is_err());
    }

    #[test]
    fn test_empty_search() {
        let index = VectorIndex::new(4, 10, &IndexingConfig::default());
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 3).unwrap().is_empty());
    }
}
