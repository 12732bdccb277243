//! Tantivy keyword index over chunk text

use crate::index::{CandidateRef, IndexError, KeywordBackend};
use crate::storage::{Chunk, ChunkId};
use std::path::{Path, PathBuf};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Tantivy keyword index wrapper
///
/// BM25 ranking over the `text` field. The retrieval path only reads; the
/// writer half exists for the ingestion tooling and is absent when the index
/// is opened read-only.
pub struct KeywordIndex {
    index: Index,
    reader: IndexReader,
    writer: Option<IndexWriter>,
    id_field: Field,
    text_field: Field,
    index_path: PathBuf,
}

impl KeywordIndex {
    /// Open the index at `index_path` for writing, creating it if needed
    pub fn new(index_path: PathBuf) -> Result<Self, IndexError> {
        let index = if index_path.join("meta.json").exists() {
            Index::open_in_dir(&index_path)
                .map_err(|e| IndexError::InitializationError(e.to_string()))?
        } else {
            std::fs::create_dir_all(&index_path)?;
            Index::create_in_dir(&index_path, Self::schema())
                .map_err(|e| IndexError::InitializationError(e.to_string()))?
        };

        let writer = index
            .writer(WRITER_HEAP_BYTES)
            .map_err(|e| IndexError::InitializationError(e.to_string()))?;

        Self::from_index(index, Some(writer), index_path)
    }

    /// Open an existing index without taking the writer lock
    pub fn open_read_only(index_path: &Path) -> Result<Self, IndexError> {
        if !index_path.join("meta.json").exists() {
            return Err(IndexError::IndexNotFound(index_path.display().to_string()));
        }

        let index = Index::open_in_dir(index_path)
            .map_err(|e| IndexError::InitializationError(e.to_string()))?;

        Self::from_index(index, None, index_path.to_path_buf())
    }

    fn schema() -> Schema {
        let mut schema_builder = Schema::builder();
        schema_builder.add_u64_field("id", INDEXED | STORED);
        schema_builder.add_text_field("text", TEXT);
        schema_builder.build()
    }

    fn from_index(
        index: Index,
        writer: Option<IndexWriter>,
        index_path: PathBuf,
    ) -> Result<Self, IndexError> {
        let schema = index.schema();

        let id_field = schema.get_field("id").map_err(|_| {
            IndexError::InitializationError("Missing 'id' field in schema".to_string())
        })?;

        let text_field = schema.get_field("text").map_err(|_| {
            IndexError::InitializationError("Missing 'text' field in schema".to_string())
        })?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e| IndexError::InitializationError(e.to_string()))?;

        Ok(Self {
            index,
            reader,
            writer,
            id_field,
            text_field,
            index_path,
        })
    }

    fn writer(&self) -> Result<&IndexWriter, IndexError> {
        self.writer.as_ref().ok_or_else(|| {
            IndexError::InsertError(format!(
                "Index at {} was opened read-only",
                self.index_path.display()
            ))
        })
    }

    /// Add a document; visible to searches after [`commit`](Self::commit)
    pub fn insert(&self, id: ChunkId, text: &str) -> Result<(), IndexError> {
        let doc = doc!(
            self.id_field => id,
            self.text_field => text,
        );

        self.writer()?
            .add_document(doc)
            .map_err(|e| IndexError::InsertError(e.to_string()))?;

        Ok(())
    }

    /// Index a batch of chunks
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> Result<(), IndexError> {
        for chunk in chunks {
            self.insert(chunk.id, &chunk.text)?;
        }
        Ok(())
    }

    /// Commit all pending changes and reload the reader
    pub fn commit(&mut self) -> Result<(), IndexError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            IndexError::InsertError("Index was opened read-only".to_string())
        })?;
        writer
            .commit()
            .map_err(|e| IndexError::InsertError(e.to_string()))?;

        self.reader
            .reload()
            .map_err(|e| IndexError::SearchError(e.to_string()))?;

        Ok(())
    }

    /// Delete a document by ID
    pub fn delete(&self, id: ChunkId) -> Result<(), IndexError> {
        let term = Term::from_field_u64(self.id_field, id);
        self.writer()?.delete_term(term);
        Ok(())
    }

    /// Get the number of documents in the index
    pub fn len(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeywordBackend for KeywordIndex {
    /// Free-text search; query syntax errors are tolerated rather than rejected
    fn search(&self, query: &str, k: usize) -> Result<Vec<CandidateRef>, IndexError> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();

        // User queries contain '?', quotes and the like; lenient parsing keeps
        // whatever terms it can instead of failing the backend
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        let (parsed, errors) = query_parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!("Keyword query parsed with {} recoverable errors", errors.len());
        }

        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(k))
            .map_err(|e| IndexError::SearchError(e.to_string()))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let retrieved_doc: TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| IndexError::SearchError(e.to_string()))?;

            let id = retrieved_doc
                .get_first(self.id_field)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| IndexError::SearchError("Missing or invalid ID field".to_string()))?;

            results.push(CandidateRef::new(id, score));
        }

        Ok(results)
    }

    fn name(&self) -> &str {
        "tantivy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populated(temp: &TempDir) -> KeywordIndex {
        let mut index = KeywordIndex::new(temp.path().join("kw")).unwrap();
        index
            .insert(1, "Rama was the eldest son of King Dasharatha of Ayodhya")
            .unwrap();
        index
            .insert(2, "Ravana, the king of Lanka, abducted Sita")
            .unwrap();
        index
            .insert(3, "Hanuman leapt across the ocean to Lanka")
            .unwrap();
        index.commit().unwrap();
        index
    }

    #[test]
    fn test_index_creation() {
        let temp = TempDir::new().unwrap();
        let index = KeywordIndex::new(temp.path().join("kw")).unwrap();
        assert_eq!(index.len(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_and_search() {
        let temp = TempDir::new().unwrap();
        let index = populated(&temp);
        assert_eq!(index.len(), 3);

        let results = index.search("Lanka", 10).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.id == 2 || r.id == 3));

        let results = index.search("Ayodhya", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn test_natural_language_query_is_lenient() {
        let temp = TempDir::new().unwrap();
        let index = populated(&temp);

        // Trailing '?' and unbalanced quote must not fail the backend
        let results = index.search("Who is \"Rama?", 10).unwrap();
        assert!(results.iter().any(|r| r.id == 1));
    }

    #[test]
    fn test_limit_respected() {
        let temp = TempDir::new().unwrap();
        let index = populated(&temp);
        assert_eq!(index.search("Lanka", 1).unwrap().len(), 1);
        assert!(index.search("Lanka", 0).unwrap().is_empty());
    }

    #[test]
    fn test_read_only_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kw");
        {
            let _ = populated(&temp);
        }

        let index = KeywordIndex::open_read_only(&path).unwrap();
        assert_eq!(index.len(), 3);
        assert!(index.insert(9, "should fail").is_err());
        assert_eq!(index.search("Hanuman", 5).unwrap()[0].id, 3);
    }

    #[test]
    fn test_read_only_missing() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            KeywordIndex::open_read_only(&temp.path().join("absent")),
            Err(IndexError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_delete() {
        let temp = TempDir::new().unwrap();
        let mut index = populated(&temp);

        index.delete(1).unwrap();
        index.commit().unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.search("Ayodhya", 10).unwrap().is_empty());
    }
}
