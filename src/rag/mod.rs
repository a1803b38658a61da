//! Question answering over the chapter corpus.
//!
//! [`RagSystem`] ties the capabilities together: it answers questions either
//! through the tool loop ([`orchestrator`]) or by a single retrieval-backed
//! model call, and rebuilds the index on request.
pub mod orchestrator;
pub mod retriever;
pub mod tools;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::db::{StoreError, VectorIndex};
use crate::embedder::{Embedder, EmbedderError};
use crate::indexer::cache::MetadataCache;
use crate::indexer::core::{IndexError, IndexReport, Indexer};
use crate::llm::{ChatError, ChatModel, Message};
use orchestrator::{FALLBACK_ANSWER, Orchestrator, ToolCallRecord};
use retriever::{RetrievalResult, Retriever};
use tools::{CourseOutlineTool, SEARCH_CONTENT, SearchContentTool, ToolRegistry};

/// Passages retrieved for the plain answer path.
const PLAIN_CONTEXT_SIZE: usize = 3;

const PLAIN_SYSTEM_PROMPT: &str = "You are a helpful assistant for a course made of numbered \
chapters. Answer questions using the provided chapter excerpts and always cite the chapters you \
used. If the excerpts do not contain the answer, say so clearly. Be concise and practical.";

#[derive(Error, Debug)]
pub enum RagError {
    #[error("{0}")]
    Validation(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("vector store failed: {0}")]
    Store(#[from] StoreError),

    #[error("chat model failed: {0}")]
    Chat(#[from] ChatError),

    #[error("{0}")]
    Corpus(String),

    #[error("vector index is empty")]
    NotIndexed,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl RagError {
    /// Failures of an external collaborator (embedder, store, chat API).
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Embedding(_) | Self::Store(_) | Self::Chat(_))
    }
}

impl From<IndexError> for RagError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Embedding(e) => Self::Embedding(e),
            IndexError::Store(e) => Self::Store(e),
            other => Self::Corpus(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Source {
    pub chapter: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub context_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Engine settings, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RagSettings {
    pub chapters_dir: PathBuf,
    pub default_top_k: usize,
    pub max_tool_iterations: usize,
    pub use_tools: bool,
    pub embed_batch_size: usize,
}

impl From<&Config> for RagSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            chapters_dir: cfg.chapters_dir.clone(),
            default_top_k: cfg.default_top_k,
            max_tool_iterations: cfg.max_tool_iterations,
            use_tools: cfg.use_tools,
            embed_batch_size: cfg.embed_batch_size,
        }
    }
}

pub struct RagSystem {
    settings: RagSettings,
    embedder: Arc<dyn Embedder>,
    index: Arc<Mutex<dyn VectorIndex>>,
    retriever: Arc<Retriever>,
    cache: Arc<MetadataCache>,
    tools: ToolRegistry,
    model: Arc<dyn ChatModel>,
}

/// Distinct chapters in first-seen order.
fn dedup_sources(sources: impl IntoIterator<Item = Source>) -> Vec<Source> {
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .filter(|s| seen.insert(s.chapter.clone()))
        .collect()
}

fn format_context(results: &[RetrievalResult]) -> String {
    results
        .iter()
        .map(|r| format!("From {} - {}:\n{}", r.document_id, r.title, r.passage_text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `search_content` hits recorded during a tool turn.
fn searched_sources(calls: &[ToolCallRecord]) -> Vec<Source> {
    calls
        .iter()
        .filter(|c| c.tool_name == SEARCH_CONTENT && !c.is_error)
        .filter_map(|c| c.result.get("results").and_then(Value::as_array))
        .flatten()
        .map(|r| Source {
            chapter: r["chapter"].as_str().unwrap_or_default().to_string(),
            url: r["url"].as_str().unwrap_or_default().to_string(),
        })
        .collect()
}

impl RagSystem {
    pub fn new(
        settings: RagSettings,
        embedder: Arc<dyn Embedder>,
        index: Arc<Mutex<dyn VectorIndex>>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        let retriever = Arc::new(Retriever::new(Arc::clone(&embedder), Arc::clone(&index)));
        let cache = Arc::new(MetadataCache::new());
        let tools = ToolRegistry::new(
            SearchContentTool::new(Some(Arc::clone(&retriever)), settings.default_top_k),
            CourseOutlineTool::new(Arc::clone(&cache), settings.chapters_dir.clone()),
        );

        Self {
            settings,
            embedder,
            index,
            retriever,
            cache,
            tools,
            model,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RagSettings {
        &self.settings
    }

    #[must_use]
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Answer `question` in the configured mode.
    pub fn query(&self, question: &str) -> Result<QueryResponse, RagError> {
        self.query_with(question, self.settings.use_tools)
    }

    pub fn query_with(&self, question: &str, use_tools: bool) -> Result<QueryResponse, RagError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::Validation("Question cannot be empty".into()));
        }

        if use_tools {
            self.answer_with_tools(question)
        } else {
            self.answer_from_context(question)
        }
    }

    fn answer_with_tools(&self, question: &str) -> Result<QueryResponse, RagError> {
        let outcome = Orchestrator::new(
            self.model.as_ref(),
            &self.tools,
            self.settings.max_tool_iterations,
        )
        .run(question)?;

        let hits = searched_sources(&outcome.tool_calls);
        Ok(QueryResponse {
            answer: outcome.answer,
            context_count: hits.len(),
            sources: dedup_sources(hits),
            tool_calls: outcome.tool_calls,
        })
    }

    fn answer_from_context(&self, question: &str) -> Result<QueryResponse, RagError> {
        let context = self.retriever.retrieve(question, PLAIN_CONTEXT_SIZE)?;

        let user_message = if context.is_empty() {
            format!("Question: {question}\n\nNote: I don't have specific documentation on this topic.")
        } else {
            format!(
                "Based on the following course material:\n\n{}\n\n---\n\nPlease answer this question: {question}",
                format_context(&context)
            )
        };

        let response =
            self.model
                .respond(PLAIN_SYSTEM_PROMPT, &[Message::user_text(user_message)], &[])?;

        Ok(QueryResponse {
            answer: response.text().unwrap_or_else(|| FALLBACK_ANSWER.to_string()),
            context_count: context.len(),
            sources: dedup_sources(context.into_iter().map(|r| Source {
                chapter: r.document_id,
                url: r.url,
            })),
            tool_calls: Vec::new(),
        })
    }

    /// Rebuild the vector index from the chapter directory and drop the
    /// metadata cache.
    pub fn rebuild(&self) -> Result<IndexReport, RagError> {
        let report = Indexer::new(
            Arc::clone(&self.index),
            self.embedder.as_ref(),
            self.settings.embed_batch_size,
        )
        .rebuild(&self.settings.chapters_dir)?;
        self.cache.clear();
        Ok(report)
    }

    /// Rebuild only if the index holds nothing yet.
    pub fn ensure_indexed(&self) -> Result<Option<IndexReport>, RagError> {
        if self.indexed_count()? > 0 {
            return Ok(None);
        }
        info!("Vector index is empty, building it now");
        self.rebuild().map(Some)
    }

    pub fn indexed_count(&self) -> Result<usize, RagError> {
        self.retriever.indexed_count()
    }
}
