//! Per-corpus chapter metadata, rebuilt whenever the corpus fingerprint moves.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use super::corpus::{self, Document, Fingerprint};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lesson {
    pub number: usize,
    pub title: String,
}

/// What the outline tool needs to know about one chapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChapterSummary {
    pub id: String,
    pub number: u32,
    pub title: String,
    pub url: String,
    pub lesson_count: usize,
    pub lessons: Vec<Lesson>,
    #[serde(skip)]
    pub passage_count: usize,
}

impl From<&Document> for ChapterSummary {
    fn from(doc: &Document) -> Self {
        let lessons: Vec<Lesson> = doc
            .lessons
            .iter()
            .enumerate()
            .map(|(i, title)| Lesson {
                number: i + 1,
                title: title.clone(),
            })
            .collect();

        Self {
            id: doc.id.clone(),
            number: doc.ordinal,
            title: doc.title.clone(),
            url: doc.url.clone(),
            lesson_count: lessons.len(),
            lessons,
            passage_count: doc.passages.len(),
        }
    }
}

/// Immutable snapshot of a corpus. Replaced wholesale, never edited.
#[derive(Debug)]
pub struct CacheEntry {
    pub documents: BTreeMap<String, ChapterSummary>,
    pub fingerprint: Fingerprint,
}

impl CacheEntry {
    fn build(dir: &Path, fingerprint: Fingerprint) -> Result<Self> {
        let documents = corpus::load_documents(dir)?
            .iter()
            .map(|doc| (doc.id.clone(), ChapterSummary::from(doc)))
            .collect();
        Ok(Self {
            documents,
            fingerprint,
        })
    }

    /// Chapters ordered by ordinal, then id.
    #[must_use]
    pub fn ordered(&self) -> Vec<&ChapterSummary> {
        let mut chapters: Vec<&ChapterSummary> = self.documents.values().collect();
        chapters.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.id.cmp(&b.id)));
        chapters
    }
}

/// Shared metadata cache keyed by corpus directory.
///
/// `ensure_fresh` holds one lock across "fingerprint, compare, rebuild,
/// install", so concurrent callers never observe a half-built entry.
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: Mutex<HashMap<PathBuf, Arc<CacheEntry>>>,
    rebuilds: AtomicUsize,
}

impl MetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `dir`, rebuilt first if any chapter file was added, removed
    /// or touched since the last build.
    pub fn ensure_fresh(&self, dir: &Path) -> Result<Arc<CacheEntry>> {
        let mut entries = self.lock();
        let live = corpus::fingerprint(dir)?;

        if let Some(entry) = entries.get(dir) {
            if entry.fingerprint == live {
                return Ok(Arc::clone(entry));
            }
        }

        let entry = Arc::new(CacheEntry::build(dir, live)?);
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(
            "Rebuilt chapter metadata for {} ({} chapters)",
            dir.display(),
            entry.documents.len()
        );
        entries.insert(dir.to_path_buf(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Drop every entry; the next access rebuilds.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of rebuilds performed so far.
    #[must_use]
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<CacheEntry>>> {
        // Entries are swapped whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}
