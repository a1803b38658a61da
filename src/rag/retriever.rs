//! Query embedding, nearest-neighbour lookup and relevance scoring.
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::RagError;
use crate::db::{RawHit, StoreError, VectorIndex};
use crate::embedder::Embedder;

pub const MIN_TOP_K: usize = 1;
pub const MAX_TOP_K: usize = 5;

/// Relevance reported when the store gives no distance.
pub const DEFAULT_RELEVANCE: f64 = 0.8;

const UNKNOWN: &str = "Unknown";

/// One passage as shown to tools and callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub passage_text: String,
    pub document_id: String,
    pub title: String,
    pub url: String,
    pub relevance: f64,
}

impl From<RawHit> for RetrievalResult {
    fn from(hit: RawHit) -> Self {
        Self {
            relevance: relevance(hit.distance),
            passage_text: hit.content,
            document_id: hit.metadata.document_id.unwrap_or_else(|| UNKNOWN.to_string()),
            title: hit.metadata.title.unwrap_or_else(|| UNKNOWN.to_string()),
            url: hit.metadata.url.unwrap_or_default(),
        }
    }
}

#[must_use]
pub fn clamp_top_k(top_k: usize) -> usize {
    top_k.clamp(MIN_TOP_K, MAX_TOP_K)
}

/// `1 - d/2` for a cosine distance `d`, kept inside `[0, 1]`.
#[must_use]
pub fn relevance(distance: Option<f64>) -> f64 {
    match distance {
        Some(d) if d.is_finite() => (1.0 - d / 2.0).clamp(0.0, 1.0),
        Some(_) => 0.0,
        None => DEFAULT_RELEVANCE,
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<Mutex<dyn VectorIndex>>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<Mutex<dyn VectorIndex>>) -> Self {
        Self { embedder, index }
    }

    /// Up to `top_k` passages (clamped to `[1, 5]`) in the store's ranking
    /// order.
    pub fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResult>, RagError> {
        let vector = self.embedder.embed(query)?;
        let hits = self
            .index
            .lock()
            .map_err(|_| StoreError::Unavailable("index lock poisoned".into()))?
            .query(&vector, clamp_top_k(top_k))?;
        Ok(hits.into_iter().map(RetrievalResult::from).collect())
    }

    /// Number of indexed passages.
    pub fn indexed_count(&self) -> Result<usize, RagError> {
        Ok(self
            .index
            .lock()
            .map_err(|_| StoreError::Unavailable("index lock poisoned".into()))?
            .count()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{HitMetadata, PassageRecord};
    use crate::embedder::mock::MockEmbedder;

    /// Returns its canned hits, truncated to `k`.
    struct FixedIndex {
        hits: Vec<RawHit>,
    }

    impl VectorIndex for FixedIndex {
        fn upsert(&mut self, _: &[PassageRecord], _: &[Vec<f32>]) -> Result<(), StoreError> {
            Ok(())
        }
        fn clear(&mut self) -> Result<(), StoreError> {
            Ok(())
        }
        fn query(&self, _: &[f32], k: usize) -> Result<Vec<RawHit>, StoreError> {
            Ok(self.hits.iter().take(k).cloned().collect())
        }
        fn count(&self) -> Result<usize, StoreError> {
            Ok(self.hits.len())
        }
    }

    fn hit(id: &str, distance: Option<f64>, metadata: HitMetadata) -> RawHit {
        RawHit {
            id: id.into(),
            content: format!("content {id}"),
            metadata,
            distance,
        }
    }

    fn full(doc: &str) -> HitMetadata {
        HitMetadata {
            document_id: Some(doc.into()),
            title: Some("Title".into()),
            url: Some("https://e.com".into()),
        }
    }

    fn retriever(hits: Vec<RawHit>) -> Retriever {
        let index: Arc<Mutex<dyn VectorIndex>> =
            Arc::new(Mutex::new(FixedIndex { hits }));
        Retriever::new(Arc::new(MockEmbedder::default()), index)
    }

    #[test]
    fn test_relevance() {
        assert_eq!(relevance(None), 0.8);
        assert_eq!(relevance(Some(0.0)), 1.0);
        assert!((relevance(Some(0.5)) - 0.75).abs() < 1e-9);
        assert_eq!(relevance(Some(2.0)), 0.0);
        assert_eq!(relevance(Some(3.0)), 0.0);
        assert_eq!(relevance(Some(-0.2)), 1.0);
        assert_eq!(relevance(Some(f64::NAN)), 0.0);
    }

    #[test]
    fn test_clamp_top_k() {
        assert_eq!(clamp_top_k(0), 1);
        assert_eq!(clamp_top_k(3), 3);
        assert_eq!(clamp_top_k(99), 5);
    }

    #[test]
    fn test_keeps_store_order() {
        // Store order is authoritative even when relevance disagrees.
        let r = retriever(vec![
            hit("a", Some(1.0), full("chapter1")),
            hit("b", Some(0.2), full("chapter2")),
            hit("c", None, full("chapter3")),
        ]);
        let results = r.retrieve("q", 5).unwrap();
        let docs: Vec<_> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(docs, vec!["chapter1", "chapter2", "chapter3"]);
        assert_eq!(results[2].relevance, DEFAULT_RELEVANCE);
    }

    #[test]
    fn test_top_k_is_clamped() {
        let hits: Vec<_> = (0..8)
            .map(|i| hit(&i.to_string(), Some(0.1), full("c")))
            .collect();
        let r = retriever(hits);
        assert_eq!(r.retrieve("q", 0).unwrap().len(), 1);
        assert_eq!(r.retrieve("q", 99).unwrap().len(), 5);
    }

    #[test]
    fn test_missing_metadata_uses_placeholders() {
        let r = retriever(vec![hit("a", Some(0.4), HitMetadata::default())]);
        let results = r.retrieve("q", 3).unwrap();
        assert_eq!(results[0].document_id, "Unknown");
        assert_eq!(results[0].title, "Unknown");
        assert_eq!(results[0].url, "");
    }

    #[test]
    fn test_empty_results() {
        let r = retriever(Vec::new());
        assert!(r.retrieve("q", 3).unwrap().is_empty());
        assert_eq!(r.indexed_count().unwrap(), 0);
    }
}
