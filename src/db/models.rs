use crate::indexer::corpus::Passage;

/// A passage as stored in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct PassageRecord {
    pub id: String,
    pub document_id: String,
    pub title: String,
    pub url: String,
    pub sequence: usize,
    /// Stored text; this is also what was embedded.
    pub content: String,
}

impl PassageRecord {
    #[must_use]
    pub fn from_passage(passage: &Passage, url: &str) -> Self {
        Self {
            id: passage.id(),
            document_id: passage.document_id.clone(),
            title: passage.title.clone(),
            url: url.to_string(),
            sequence: passage.sequence_index,
            content: passage.embedding_text(),
        }
    }
}

/// Payload fields a store may or may not return with a hit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HitMetadata {
    pub document_id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
}

/// One nearest-neighbour result, straight from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub id: String,
    pub content: String,
    pub metadata: HitMetadata,
    /// Cosine distance in `[0, 2]`, when the store reports one.
    pub distance: Option<f64>,
}
