//! Passage vector store backed by SQLite and sqlite-vec.
use std::path::Path;
use std::sync::Once;

use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use thiserror::Error;
use tracing::info;

pub mod models;
pub mod passages;
pub mod search;

pub use models::{HitMetadata, PassageRecord, RawHit};

/// Errors raised by a vector index.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("{records} records but {vectors} vectors")]
    LengthMismatch { records: usize, vectors: usize },

    #[error("vector store unavailable: {0}")]
    Unavailable(String),
}

/// Nearest-neighbour store for passage vectors.
///
/// Implementations rank results themselves; callers keep the order they
/// receive.
pub trait VectorIndex: Send {
    /// Insert or replace records by id.
    fn upsert(&mut self, records: &[PassageRecord], vectors: &[Vec<f32>]) -> Result<(), StoreError>;

    /// Remove every record.
    fn clear(&mut self) -> Result<(), StoreError>;

    /// Up to `k` nearest records to `vector`, closest first.
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RawHit>, StoreError>;

    /// Number of stored records.
    fn count(&self) -> Result<usize, StoreError>;

    /// Swap the whole contents for `records`.
    fn replace_all(
        &mut self,
        records: &[PassageRecord],
        vectors: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        self.clear()?;
        self.upsert(records, vectors)
    }
}

fn schema_sql(dimensions: usize) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS passages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    passage_id TEXT NOT NULL UNIQUE,
    document_id TEXT,
    title TEXT,
    url TEXT,
    sequence INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL,
    indexed_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_passages_document ON passages(document_id);

CREATE VIRTUAL TABLE IF NOT EXISTS vec_passages USING vec0(
    embedding FLOAT[{dimensions}]
);
"#
    )
}

static INIT_VEC: Once = Once::new();

/// Register the sqlite-vec extension for every new connection. Safe to call
/// multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// A SQLite connection with sqlite-vec loaded and the passage schema in place.
pub struct Db {
    pub(crate) conn: Connection,
    dimensions: usize,
}

impl Db {
    /// Open (or create) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening vector store: {}", path.display());
        init_sqlite_vec();
        Self::init(Connection::open(path)?, dimensions)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory(dimensions: usize) -> Result<Self, StoreError> {
        init_sqlite_vec();
        Self::init(Connection::open_in_memory()?, dimensions)
    }

    fn init(conn: Connection, dimensions: usize) -> Result<Self, StoreError> {
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {vec_version}");

        conn.execute_batch(&schema_sql(dimensions))?;
        Ok(Self { conn, dimensions })
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), StoreError> {
        if vector.len() != self.dimensions {
            return Err(StoreError::Dimension {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Raw float32 bytes of `vec`, the layout vec0 columns expect.
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice::<f32, u8>(vec).to_vec()
}
