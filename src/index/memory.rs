//! In-memory backends for small corpora and tests

use crate::embedding::cosine_similarity;
use crate::index::{CandidateRef, IndexError, KeywordBackend, VectorBackend};
use crate::storage::{Chunk, ChunkId};
use ahash::AHashMap;

/// Okapi BM25 over lowercased alphanumeric tokens
///
/// Uses the Lucene form of IDF (`ln(1 + (N - n + 0.5) / (n + 0.5))`) so a
/// term present in every document still contributes a small positive weight.
pub struct Bm25Index {
    ids: Vec<ChunkId>,
    doc_lens: Vec<u32>,
    postings: AHashMap<String, Vec<(usize, u32)>>,
    avg_doc_len: f32,
    k1: f32,
    b: f32,
}

impl Bm25Index {
    pub const DEFAULT_K1: f32 = 1.5;
    pub const DEFAULT_B: f32 = 0.75;

    /// Build from `(id, text)` pairs; insertion order breaks score ties
    pub fn build<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = (ChunkId, S)>,
        S: AsRef<str>,
    {
        let mut ids = Vec::new();
        let mut doc_lens = Vec::new();
        let mut postings: AHashMap<String, Vec<(usize, u32)>> = AHashMap::new();

        for (doc_idx, (id, text)) in documents.into_iter().enumerate() {
            let tokens = tokenize(text.as_ref());
            let mut term_freqs: AHashMap<String, u32> = AHashMap::new();
            for token in &tokens {
                *term_freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for (term, tf) in term_freqs {
                postings.entry(term).or_default().push((doc_idx, tf));
            }
            ids.push(id);
            doc_lens.push(tokens.len() as u32);
        }

        let avg_doc_len = if doc_lens.is_empty() {
            0.0
        } else {
            doc_lens.iter().map(|&l| l as f32).sum::<f32>() / doc_lens.len() as f32
        };

        Self {
            ids,
            doc_lens,
            postings,
            avg_doc_len,
            k1: Self::DEFAULT_K1,
            b: Self::DEFAULT_B,
        }
    }

    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        Self::build(chunks.iter().map(|c| (c.id, c.text.as_str())))
    }

    pub fn with_params(mut self, k1: f32, b: f32) -> Self {
        self.k1 = k1;
        self.b = b;
        self
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn idf(&self, doc_freq: usize) -> f32 {
        let n = self.ids.len() as f32;
        let df = doc_freq as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }
}

impl KeywordBackend for Bm25Index {
    fn search(&self, query: &str, k: usize) -> Result<Vec<CandidateRef>, IndexError> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let mut scores = vec![0.0f32; self.ids.len()];
        for term in &terms {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(posting.len());
            for &(doc_idx, tf) in posting {
                let tf = tf as f32;
                let dl = self.doc_lens[doc_idx] as f32;
                let norm = self.k1 * (1.0 - self.b + self.b * dl / self.avg_doc_len.max(1.0));
                scores[doc_idx] += idf * tf * (self.k1 + 1.0) / (tf + norm);
            }
        }

        let mut ranked: Vec<(usize, f32)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, s)| *s > 0.0)
            .collect();
        // Stable sort keeps insertion order among equal scores
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);

        Ok(ranked
            .into_iter()
            .map(|(doc_idx, score)| CandidateRef::new(self.ids[doc_idx], score))
            .collect())
    }

    fn name(&self) -> &str {
        "bm25"
    }
}

/// Lowercase alphanumeric tokens
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Exact cosine search over every stored vector
pub struct FlatVectorIndex {
    dimension: usize,
    vectors: Vec<(ChunkId, Vec<f32>)>,
}

impl FlatVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }

    pub fn from_chunks(dimension: usize, chunks: &[Chunk]) -> Result<Self, IndexError> {
        let mut index = Self::new(dimension);
        for chunk in chunks {
            index.insert(chunk.id, chunk.embedding.clone())?;
        }
        Ok(index)
    }

    pub fn insert(&mut self, id: ChunkId, vector: Vec<f32>) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.vectors.push((id, vector));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl VectorBackend for FlatVectorIndex {
    fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<CandidateRef>, IndexError> {
        if embedding.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }

        let mut results: Vec<CandidateRef> = self
            .vectors
            .iter()
            .map(|(id, v)| CandidateRef::new(*id, cosine_similarity(embedding, v)))
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "flat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Bm25Index {
        Bm25Index::build(vec![
            (10, "Rama was the prince of Ayodhya."),
            (11, "Ravana ruled Lanka and abducted Sita."),
            (12, "Rama and Ravana fought a long battle at Lanka."),
            (13, "The monsoon arrives in June."),
        ])
    }

    #[test]
    fn test_bm25_ranks_matching_documents() {
        let index = corpus();
        let results = index.search("Who is Rama?", 10).unwrap();
        let ids: Vec<ChunkId> = results.iter().map(|r| r.id).collect();
        assert!(ids.contains(&10));
        assert!(ids.contains(&12));
        assert!(!ids.contains(&13));
    }

    #[test]
    fn test_bm25_shorter_document_wins_on_equal_tf() {
        let index = corpus();
        let results = index.search("rama", 10).unwrap();
        // Same term frequency, doc 10 is shorter than doc 12
        assert_eq!(results[0].id, 10);
    }

    #[test]
    fn test_bm25_no_match_and_limits() {
        let index = corpus();
        assert!(index.search("xylophone", 10).unwrap().is_empty());
        assert_eq!(index.search("lanka", 1).unwrap().len(), 1);
        assert!(index.search("lanka", 0).unwrap().is_empty());
        assert!(Bm25Index::build(Vec::<(ChunkId, &str)>::new())
            .search("rama", 5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Who is Rama?"), vec!["who", "is", "rama"]);
        assert!(tokenize("... !!!").is_empty());
    }

    #[test]
    fn test_flat_vector_search() {
        let mut index = FlatVectorIndex::new(3);
        index.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(2, vec![0.0, 1.0, 0.0]).unwrap();
        index.insert(3, vec![0.7, 0.7, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.1, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 1);
        assert_eq!(results[1].id, 3);

        assert!(index.insert(4, vec![1.0]).is_err());
        assert!(index.search(&[1.0], 2).is_err());
    }
}
