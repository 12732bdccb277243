//! SQLite chunk store with migrations
//!
//! Holds chunk text, location and embedding as written by the ingestion
//! tooling. The retrieval path only reads from it.

use crate::storage::{Chunk, ChunkId, ChunkStore, StorageError};
use ahash::AHashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter};
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite has a default limit of 999 bound parameters per statement
const MAX_IDS_PER_QUERY: usize = 500;

/// Pooled SQLite chunk store
pub struct SqliteChunkStore {
    pool: DbPool,
}

impl SqliteChunkStore {
    /// Open (or create) the store at `db_path` and run pending migrations
    pub fn new(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        // Per-connection settings; WAL itself is persistent in the file
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder().max_size(16).build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }

        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying chunk store migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    /// Insert or replace chunks (ingestion side)
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> Result<usize, StorageError> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO chunks
                    (id, text, source_file, page, chunk_index, embedding, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.id as i64,
                    chunk.text,
                    chunk.source_file,
                    chunk.page,
                    chunk.chunk_index,
                    encode_embedding(&chunk.embedding),
                    chunk.content_hash(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    /// Every chunk, ordered by id; used to rebuild in-memory indexes at startup
    pub fn all_chunks(&self) -> Result<Vec<Chunk>, StorageError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, text, source_file, page, chunk_index, embedding FROM chunks ORDER BY id",
        )?;
        let rows = stmt.query_map([], read_row)?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(decode_row(row?)?);
        }
        Ok(chunks)
    }

    /// Get store statistics
    pub fn stats(&self) -> Result<ChunkDbStats, StorageError> {
        let conn = self.get_conn()?;

        let chunk_count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        let source_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT source_file) FROM chunks",
            [],
            |row| row.get(0),
        )?;
        let embedded_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE length(embedding) > 0",
            [],
            |row| row.get(0),
        )?;

        Ok(ChunkDbStats {
            chunk_count: chunk_count as usize,
            source_count: source_count as usize,
            embedded_count: embedded_count as usize,
        })
    }
}

impl ChunkStore for SqliteChunkStore {
    fn get_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.get_conn()?;
        let mut found: AHashMap<ChunkId, Chunk> = AHashMap::with_capacity(ids.len());

        for batch in ids.chunks(MAX_IDS_PER_QUERY) {
            let placeholders = vec!["?"; batch.len()].join(",");
            let sql = format!(
                "SELECT id, text, source_file, page, chunk_index, embedding
                 FROM chunks WHERE id IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(batch.iter().map(|id| *id as i64)), read_row)?;
            for row in rows {
                let chunk = decode_row(row?)?;
                found.insert(chunk.id, chunk);
            }
        }

        // Preserve the caller's (rank) order
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Chunk store statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDbStats {
    pub chunk_count: usize,
    pub source_count: usize,
    pub embedded_count: usize,
}

type RawRow = (i64, String, String, u32, u32, Vec<u8>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<Chunk, StorageError> {
    let (id, text, source_file, page, chunk_index, blob) = raw;
    let id = id as ChunkId;
    let embedding = decode_embedding(&blob).ok_or_else(|| StorageError::Corrupt {
        id,
        message: format!("embedding blob of {} bytes is not a f32 array", blob.len()),
    })?;
    Ok(Chunk {
        id,
        text,
        embedding,
        source_file,
        page,
        chunk_index,
    })
}

/// Little-endian f32 array
fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: chunk table
    r#"
    CREATE TABLE chunks (
        id INTEGER PRIMARY KEY,
        text TEXT NOT NULL,
        source_file TEXT NOT NULL,
        page INTEGER NOT NULL,
        chunk_index INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        content_hash TEXT NOT NULL
    );

    CREATE INDEX idx_chunks_source_page ON chunks(source_file, page);
    CREATE INDEX idx_chunks_hash ON chunks(content_hash);
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Vec<Chunk> {
        vec![
            Chunk::new(1, "Rama was the prince of Ayodhya.", vec![0.1, 0.2], "ramayana.pdf", 3, 0),
            Chunk::new(2, "Ravana ruled Lanka.", vec![0.3, -0.4], "ramayana.pdf", 9, 1),
            Chunk::new(3, "Unembedded note.", vec![], "notes.txt", 1, 0),
        ]
    }

    #[test]
    fn test_store_creation_and_migrations() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("chunks.db");

        let store = SqliteChunkStore::new(&db_path).unwrap();
        assert!(db_path.exists());

        let conn = store.get_conn().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i32);

        // Reopening does not re-run migrations
        drop(conn);
        drop(store);
        assert!(SqliteChunkStore::new(&db_path).is_ok());
    }

    #[test]
    fn test_insert_and_get_in_request_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteChunkStore::new(&temp_dir.path().join("chunks.db")).unwrap();
        assert_eq!(store.insert_chunks(&sample()).unwrap(), 3);

        let chunks = store.get_chunks(&[2, 42, 1]).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, 2);
        assert_eq!(chunks[0].embedding, vec![0.3, -0.4]);
        assert_eq!(chunks[1].source_file, "ramayana.pdf");
        assert_eq!(chunks[1].page, 3);
    }

    #[test]
    fn test_stats_and_all_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteChunkStore::new(&temp_dir.path().join("chunks.db")).unwrap();
        store.insert_chunks(&sample()).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(
            stats,
            ChunkDbStats {
                chunk_count: 3,
                source_count: 2,
                embedded_count: 2,
            }
        );

        let all = store.all_chunks().unwrap();
        assert_eq!(all.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(all[2].embedding.is_empty());
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_replace_existing_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteChunkStore::new(&temp_dir.path().join("chunks.db")).unwrap();
        store.insert_chunks(&sample()).unwrap();
        store
            .insert_chunks(&[Chunk::new(1, "Re-ingested text.", vec![], "ramayana.pdf", 3, 0)])
            .unwrap();

        let chunk = &store.get_chunks(&[1]).unwrap()[0];
        assert_eq!(chunk.text, "Re-ingested text.");
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_embedding_codec_rejects_partial_floats() {
        assert_eq!(decode_embedding(&encode_embedding(&[1.5, -2.0])), Some(vec![1.5, -2.0]));
        assert!(decode_embedding(&[0, 1, 2]).is_none());
    }
}
