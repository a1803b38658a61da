/// End-to-end tests for the chapterrag pipeline.
///
///   chapters on disk → Indexer → SQLite store → Retriever / tools → answer
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chapterrag::config::Config;
use chapterrag::db::{Db, VectorIndex};
use chapterrag::embedder::Embedder;
use chapterrag::embedder::mock::MockEmbedder;
use chapterrag::indexer::cache::MetadataCache;
use chapterrag::indexer::core::Indexer;
use chapterrag::llm::mock::{ScriptedChatModel, text_reply, tool_reply};
use chapterrag::rag::orchestrator::FALLBACK_ANSWER;
use chapterrag::rag::retriever::Retriever;
use chapterrag::rag::tools::{CourseOutlineTool, SearchContentTool, Tool};
use chapterrag::rag::{RagSettings, RagSystem};
use serde_json::json;
use tempfile::{TempDir, tempdir};

fn write_course(dir: &Path) {
    fs::write(
        dir.join("chapter1_getting_started.md"),
        r#"---
title: Getting Started
url: "https://example.com/chapter1"
---

# Getting Started

Welcome to the course.

## Installation

Install the CLI with your package manager.

## First Run

Run the CLI in a project directory.
"#,
    )
    .unwrap();

    fs::write(
        dir.join("chapter2_core_tools.md"),
        r#"---
title: Core Tools
url: "https://example.com/chapter2"
---

## Reading Files

The read tool opens a file.

```markdown
## This heading is an example, not a section
```

## Editing Files

The edit tool changes a file in place.
"#,
    )
    .unwrap();

    fs::write(
        dir.join("chapter3_advanced.md"),
        "---\ntitle: Advanced\n---\n## Hooks\nHooks run on events.\n",
    )
    .unwrap();
}

fn course() -> TempDir {
    let dir = tempdir().unwrap();
    write_course(dir.path());
    dir
}

fn engine(dir: &TempDir, model: Arc<ScriptedChatModel>) -> RagSystem {
    let index: Arc<Mutex<dyn VectorIndex>> =
        Arc::new(Mutex::new(Db::open_in_memory(384).unwrap()));
    let mut config = Config::default();
    config.chapters_dir = dir.path().to_path_buf();
    RagSystem::new(
        RagSettings::from(&config),
        Arc::new(MockEmbedder::default()),
        index,
        model,
    )
}

/// Index → search → outline, without a chat model.
#[test]
fn test_index_search_outline() {
    let dir = course();
    let db: Arc<Mutex<dyn VectorIndex>> = Arc::new(Mutex::new(Db::open_in_memory(384).unwrap()));
    let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::default());

    let report = Indexer::new(db.clone(), embedder.as_ref(), 2)
        .rebuild(dir.path())
        .unwrap();
    assert_eq!(report.documents_loaded, 3);
    // chapter1: preamble + 2 sections, chapter2: 2 sections, chapter3: 1 section
    assert_eq!(report.passages_indexed, 6, "{report:?}");

    let search = SearchContentTool::new(Some(Arc::new(Retriever::new(embedder, db))), 3);
    let out = search
        .call(&json!({"query": "how do I edit a file?", "top_k": 10}))
        .unwrap();
    assert_eq!(out["results_count"], 5);
    for result in out["results"].as_array().unwrap() {
        let relevance = result["relevance"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&relevance));
        assert!(result["chapter"].as_str().unwrap().starts_with("chapter"));
    }

    let outline = CourseOutlineTool::new(Arc::new(MetadataCache::new()), dir.path().to_path_buf());
    let out = outline.call(&json!({"course_identifier": "core tools"})).unwrap();
    assert_eq!(out["course"]["number"], 2);
    assert_eq!(
        out["course"]["lessons"],
        json!([
            {"number": 1, "title": "Reading Files"},
            {"number": 2, "title": "Editing Files"}
        ])
    );
}

/// A question answered after one search and one outline lookup.
#[test]
fn test_tool_turn_end_to_end() {
    let dir = course();
    let model = Arc::new(ScriptedChatModel::new([
        tool_reply("s1", "search_content", json!({"query": "install", "top_k": "2"})),
        tool_reply("o1", "get_course_outline", json!({"course_identifier": "1"})),
        text_reply("Install the CLI, then see chapter 1's First Run lesson."),
    ]));
    let rag = engine(&dir, model.clone());
    rag.rebuild().unwrap();

    let resp = rag.query("How do I install it?").unwrap();
    assert_eq!(resp.answer, "Install the CLI, then see chapter 1's First Run lesson.");
    assert_eq!(resp.context_count, 2);
    assert_eq!(resp.tool_calls.len(), 2);
    assert!(resp.tool_calls[1].result_summary.chars().count() <= 200);
    assert!(resp.sources.len() <= 2);
    assert_eq!(model.call_count(), 3);
}

/// Five tool requests in a row exhaust the budget.
#[test]
fn test_tool_loop_budget() {
    let dir = course();
    let model = Arc::new(ScriptedChatModel::new((0..5).map(|i| {
        tool_reply(&format!("t{i}"), "search_content", json!({"query": "hooks"}))
    })));
    let rag = engine(&dir, model.clone());
    rag.rebuild().unwrap();

    let resp = rag.query("Tell me everything").unwrap();
    assert_eq!(resp.answer, FALLBACK_ANSWER);
    assert_eq!(resp.tool_calls.len(), 5);
    assert_eq!(model.call_count(), 5);
}

/// Chapter edits are visible to the outline tool without a rebuild, and to
/// search after one.
#[test]
fn test_corpus_changes() {
    let dir = course();
    let model = Arc::new(ScriptedChatModel::new([
        tool_reply("o1", "get_course_outline", json!({"course_identifier": "all"})),
        text_reply("Four chapters."),
    ]));
    let rag = engine(&dir, model);
    rag.rebuild().unwrap();
    assert_eq!(rag.indexed_count().unwrap(), 6);

    fs::write(
        dir.path().join("chapter4_extras.md"),
        "---\ntitle: Extras\n---\n## Plugins\nPlugins extend the CLI.\n",
    )
    .unwrap();

    let resp = rag.query("How many chapters are there?").unwrap();
    assert_eq!(resp.tool_calls[0].result["courses_count"], 4);

    rag.rebuild().unwrap();
    assert_eq!(rag.indexed_count().unwrap(), 7);
}
