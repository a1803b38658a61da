use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chapterrag::config::{Config, EmbedderBackend};
use chapterrag::db::{Db, VectorIndex};
use chapterrag::embedder::download::download_model_files;
use chapterrag::embedder::mock::MockEmbedder;
use chapterrag::embedder::onnx::OnnxEmbedder;
use chapterrag::embedder::Embedder;
use chapterrag::indexer::cache::MetadataCache;
use chapterrag::llm::anthropic::AnthropicClient;
use chapterrag::llm::mock::ScriptedChatModel;
use chapterrag::llm::ChatModel;
use chapterrag::rag::tools::{CourseOutlineTool, Tool};
use chapterrag::rag::{RagSettings, RagSystem};
use chapterrag::server::{self, AppState};

#[derive(Parser)]
#[command(name = "chapterrag", version, about = "Ask questions about a folder of markdown chapters")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve,
    /// Rebuild the vector index and print the report
    Index,
    /// Answer one question
    Ask {
        question: String,
        /// Answer from fixed retrieval instead of letting the model call tools
        #[arg(long)]
        no_tools: bool,
    },
    /// Print the chapter outline ("all" when omitted)
    Outline { identifier: Option<String> },
}

fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.model.backend {
        EmbedderBackend::Mock => Arc::new(MockEmbedder::new(config.model.dimensions)),
        EmbedderBackend::Onnx => {
            download_model_files(&config.model.dir).context("failed to fetch embedding model")?;
            Arc::new(OnnxEmbedder::new(&config.model.dir)?)
        }
    };

    anyhow::ensure!(
        embedder.dimensions() == config.model.dimensions,
        "model {} produces {}-dimensional vectors but model.dimensions is {}",
        config.model.name,
        embedder.dimensions(),
        config.model.dimensions
    );
    Ok(embedder)
}

fn open_index(config: &Config) -> Result<Arc<Mutex<dyn VectorIndex>>> {
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db = Db::open(&config.db_path, config.model.dimensions).context("Failed to open database")?;
    Ok(Arc::new(Mutex::new(db)))
}

fn build_engine(config: &Config, model: Arc<dyn ChatModel>) -> Result<RagSystem> {
    Ok(RagSystem::new(
        RagSettings::from(config),
        build_embedder(config)?,
        open_index(config)?,
        model,
    ))
}

fn chat_client(config: &Config) -> Result<Arc<dyn ChatModel>> {
    let client = AnthropicClient::from_config(&config.chat, config.request_timeout())
        .context("chat model unavailable")?;
    Ok(Arc::new(client))
}

/// For commands that never talk to the chat model.
fn no_chat() -> Arc<dyn ChatModel> {
    Arc::new(ScriptedChatModel::default())
}

fn serve(config: &Config) -> Result<()> {
    let rag = Arc::new(build_engine(config, chat_client(config)?)?);

    match rag.ensure_indexed() {
        Ok(Some(report)) => info!("{}", report.message),
        Ok(None) => info!("Vector index holds {} passages", rag.indexed_count()?),
        Err(e) => warn!("Initial indexing failed, POST /api/initialize to retry: {e}"),
    }

    let state = AppState {
        rag: Arc::clone(&rag),
        timeout: config.request_timeout(),
    };
    let bind = config.bind_address();

    // The engine is created and dropped outside the runtime: its blocking
    // HTTP client must not be torn down on an async worker.
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(server::serve(state, &bind))?;
    drop(runtime);
    drop(rag);
    Ok(())
}

fn ask(config: &Config, question: &str, use_tools: bool) -> Result<()> {
    let rag = build_engine(config, chat_client(config)?)?;
    rag.ensure_indexed()?;

    let response = rag.query_with(question, use_tools)?;
    println!("{}", response.answer);
    if !response.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &response.sources {
            if source.url.is_empty() {
                println!("  - {}", source.chapter);
            } else {
                println!("  - {} ({})", source.chapter, source.url);
            }
        }
    }
    for call in &response.tool_calls {
        info!("tool call {} {}", call.tool_name, call.input);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    config.validate().context("invalid configuration")?;
    if !Path::new(&config.chapters_dir).is_dir() {
        warn!("Chapter directory {} does not exist", config.chapters_dir.display());
    }

    match cli.command {
        Command::Serve => serve(&config),
        Command::Index => {
            let rag = build_engine(&config, no_chat())?;
            let report = rag.rebuild()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Ask { question, no_tools } => ask(&config, &question, !no_tools),
        Command::Outline { identifier } => {
            let tool = CourseOutlineTool::new(
                Arc::new(MetadataCache::new()),
                config.chapters_dir.clone(),
            );
            let input = match identifier {
                Some(id) => serde_json::json!({ "course_identifier": id }),
                None => serde_json::json!({}),
            };
            let outline = tool.call(&input)?;
            println!("{}", serde_json::to_string_pretty(&outline)?);
            Ok(())
        }
    }
}
