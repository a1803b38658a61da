use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{PassageRecord, StoreError, VectorIndex};
use crate::embedder::{Embedder, EmbedderError};
use crate::indexer::corpus;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("No markdown files found in {}", .0.display())]
    EmptyCorpus(PathBuf),

    #[error("failed to read corpus: {0:#}")]
    Corpus(anyhow::Error),

    #[error(transparent)]
    Embedding(#[from] EmbedderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a full index rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub status: String,
    pub documents_loaded: usize,
    pub passages_indexed: usize,
    pub embeddings_created: usize,
    pub message: String,
    pub indexed_at: DateTime<Utc>,
}

pub struct Indexer<'a, E: Embedder + ?Sized> {
    pub index: Arc<Mutex<dyn VectorIndex>>,
    pub embedder: &'a E,
    pub batch_size: usize,
}

impl<'a, E: Embedder + ?Sized> Indexer<'a, E> {
    pub fn new(index: Arc<Mutex<dyn VectorIndex>>, embedder: &'a E, batch_size: usize) -> Self {
        Self {
            index,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    /// Re-parse, re-chunk and re-embed every chapter in `dir`, then swap the
    /// index contents in one step. The old contents survive any failure.
    pub fn rebuild(&self, dir: &Path) -> Result<IndexReport, IndexError> {
        if corpus::list_chapter_files(dir)
            .map_err(IndexError::Corpus)?
            .is_empty()
        {
            return Err(IndexError::EmptyCorpus(dir.to_path_buf()));
        }

        let documents = corpus::load_documents(dir).map_err(IndexError::Corpus)?;
        if documents.is_empty() {
            return Err(IndexError::EmptyCorpus(dir.to_path_buf()));
        }

        let records: Vec<PassageRecord> = documents
            .iter()
            .flat_map(|doc| {
                doc.passages
                    .iter()
                    .map(|p| PassageRecord::from_passage(p, &doc.url))
            })
            .collect();

        let mut vectors = Vec::with_capacity(records.len());
        for batch in records.chunks(self.batch_size) {
            let texts: Vec<&str> = batch.iter().map(|r| r.content.as_str()).collect();
            debug!("embedding {} passages", texts.len());
            vectors.extend(self.embedder.embed_batch(&texts)?);
        }

        {
            let mut index = self
                .index
                .lock()
                .map_err(|_| StoreError::Unavailable("index lock poisoned".into()))?;
            index.replace_all(&records, &vectors)?;
        }

        info!(
            "Indexed {} passages from {} chapters in {}",
            records.len(),
            documents.len(),
            dir.display()
        );

        Ok(IndexReport {
            status: "success".to_string(),
            documents_loaded: documents.len(),
            passages_indexed: records.len(),
            embeddings_created: vectors.len(),
            message: format!(
                "Index rebuilt with {} passages from {} chapters",
                records.len(),
                documents.len()
            ),
            indexed_at: Utc::now(),
        })
    }
}
