//! Chapter corpus: a flat directory of `*.md` files.
//!
//! Each file becomes one [`Document`]. Its id is the filename stem, its
//! ordinal the first decimal number in that stem, and its title and url come
//! from frontmatter when present.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::frontmatter;
use crate::indexer::markdown;

static ORDINAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid ordinal regex"));

/// Path → modification time for every chapter file of a corpus.
pub type Fingerprint = BTreeMap<PathBuf, SystemTime>;

/// One addressable chunk of a chapter body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub document_id: String,
    pub sequence_index: usize,
    pub title: String,
    pub text: String,
}

impl Passage {
    /// Stable index key, e.g. `chapter1_chunk_0`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}_chunk_{}", self.document_id, self.sequence_index)
    }

    /// Text handed to the embedder and stored alongside the vector.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        format!("{}: {}\n{}", self.document_id, self.title, self.text)
    }
}

/// A parsed chapter file.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub url: String,
    pub ordinal: u32,
    /// `##` heading titles, in order.
    pub lessons: Vec<String>,
    /// Non-blank sections, numbered from zero.
    pub passages: Vec<Passage>,
}

impl Document {
    /// Build a document from the raw contents of the file named `id`.
    #[must_use]
    pub fn from_source(id: &str, content: &str) -> Self {
        let (meta, body) = frontmatter::parse(content);

        let passages = markdown::split_sections(&body, id)
            .into_iter()
            .filter(|s| !s.is_blank())
            .enumerate()
            .map(|(sequence_index, s)| Passage {
                document_id: id.to_string(),
                sequence_index,
                title: s.title,
                text: s.text,
            })
            .collect();

        Self {
            id: id.to_string(),
            title: meta.get_str("title").unwrap_or_else(|| id.to_string()),
            url: meta.get_str("url").unwrap_or_default(),
            ordinal: derive_ordinal(id),
            lessons: markdown::extract_headings(&body),
            passages,
        }
    }
}

/// First decimal number embedded in `stem`, or 0.
#[must_use]
pub fn derive_ordinal(stem: &str) -> u32 {
    ORDINAL
        .find(stem)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Sorted `*.md` files directly inside `dir`. Subdirectories are ignored and
/// a missing directory is an empty corpus.
pub fn list_chapter_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*.md", glob::Pattern::escape(&dir.to_string_lossy()));
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .context("invalid corpus glob pattern")?
        .flatten()
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Current fingerprint of the corpus. Files whose metadata cannot be read
/// are left out.
pub fn fingerprint(dir: &Path) -> Result<Fingerprint> {
    let mut prints = Fingerprint::new();
    for path in list_chapter_files(dir)? {
        match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                prints.insert(path, mtime);
            }
            Err(e) => warn!("cannot stat {}: {e}", path.display()),
        }
    }
    Ok(prints)
}

/// Parse one chapter file.
pub fn load_document(path: &Path) -> Result<Document> {
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("no file stem: {}", path.display()))?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Document::from_source(&id, &content))
}

/// Parse every chapter file in `dir`, in filename order. Unreadable files
/// are skipped with a warning.
pub fn load_documents(dir: &Path) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for path in list_chapter_files(dir)? {
        match load_document(&path) {
            Ok(doc) => documents.push(doc),
            Err(e) => warn!("skipping chapter: {e:#}"),
        }
    }
    Ok(documents)
}
