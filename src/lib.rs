//! # chapterrag
//!
//! Question answering over a folder of markdown chapters. Chapters are split
//! into passages at `##` headings, embedded into a SQLite vector store, and
//! served to a chat model either as fixed context or through two tools the
//! model can call in a bounded loop.
//!
//! ## Architecture
//!
//! - **[`config`]**: JSON configuration with defaults and validation
//! - **[`frontmatter`]**: YAML frontmatter extraction
//! - **[`indexer`]**: chunking, corpus loading, metadata cache, index rebuild
//! - **[`embedder`]**: text embeddings via ONNX Runtime (all-MiniLM-L6-v2)
//! - **[`db`]**: SQLite + sqlite-vec passage store
//! - **[`llm`]**: chat model capability and Anthropic Messages API client
//! - **[`rag`]**: retriever, tools, tool-calling orchestrator, query entry point
//! - **[`server`]**: axum HTTP API

pub mod config;
pub mod db;
pub mod embedder;
pub mod frontmatter;
pub mod indexer;
pub mod llm;
pub mod rag;
pub mod server;
