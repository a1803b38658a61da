//! HTTP API.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/query` | Answer a question |
//! | `POST` | `/api/initialize` | Rebuild the vector index |
//! | `GET`  | `/api/health` | Liveness and index status |
//!
//! Engine calls block, so every handler runs them on the blocking pool under
//! a deadline. Errors are `{"detail": "..."}` with no internal error text.
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::indexer::core::IndexReport;
use crate::rag::{QueryResponse, RagError, RagSystem};

const SERVICE_NAME: &str = "chapterrag";

#[derive(Clone)]
pub struct AppState {
    pub rag: Arc<RagSystem>,
    /// Deadline for one engine call.
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    /// Overrides the configured answer mode for this request.
    #[serde(default)]
    pub use_tools: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub rag_initialized: bool,
}

// ============ Error response ============

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

impl AppError {
    /// Map an engine error to a response. `generic` replaces the message of
    /// anything that might carry internal details.
    fn from_rag(err: RagError, generic: &str) -> Self {
        let (status, detail) = match &err {
            RagError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            RagError::NotIndexed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "RAG system not initialized".to_string(),
            ),
            RagError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Request timed out".to_string(),
            ),
            RagError::Corpus(msg) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{generic}: {msg}")),
            RagError::Embedding(_)
            | RagError::Store(_)
            | RagError::Chat(_)
            | RagError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, generic.to_string()),
        };

        if status.is_server_error() {
            error!("{generic}: {err}");
        } else {
            warn!("{generic}: {err}");
        }
        Self { status, detail }
    }
}

/// Run `f` on the blocking pool, giving up after the state's deadline. The
/// abandoned call keeps running but its result is discarded.
async fn run_engine<T, F>(state: &AppState, f: F) -> Result<T, RagError>
where
    T: Send + 'static,
    F: FnOnce(&RagSystem) -> Result<T, RagError> + Send + 'static,
{
    let rag = Arc::clone(&state.rag);
    let task = tokio::task::spawn_blocking(move || f(&rag));

    match tokio::time::timeout(state.timeout, task).await {
        Err(_) => Err(RagError::Timeout(state.timeout)),
        Ok(Err(join)) => Err(RagError::Internal(format!("engine task failed: {join}"))),
        Ok(Ok(result)) => result,
    }
}

// ============ Handlers ============

pub async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    const GENERIC: &str = "Error processing query";

    if request.question.trim().is_empty() {
        return Err(AppError::from_rag(
            RagError::Validation("Question cannot be empty".into()),
            GENERIC,
        ));
    }

    let QueryRequest {
        question,
        use_tools,
    } = request;

    run_engine(&state, move |rag| {
        if rag.indexed_count()? == 0 {
            return Err(RagError::NotIndexed);
        }
        let use_tools = use_tools.unwrap_or(rag.settings().use_tools);
        rag.query_with(&question, use_tools)
    })
    .await
    .map(Json)
    .map_err(|e| AppError::from_rag(e, GENERIC))
}

pub async fn handle_initialize(
    State(state): State<AppState>,
) -> Result<Json<IndexReport>, AppError> {
    let report = run_engine(&state, |rag| rag.rebuild())
        .await
        .map_err(|e| AppError::from_rag(e, "Error initializing"))?;
    info!("{}", report.message);
    Ok(Json(report))
}

pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let rag_initialized = matches!(
        run_engine(&state, |rag| rag.indexed_count()).await,
        Ok(n) if n > 0
    );
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        rag_initialized,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/query", post(handle_query))
        .route("/api/initialize", post(handle_initialize))
        .route("/api/health", get(handle_health))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Serve the API on `bind` until Ctrl-C.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Listening on http://{bind}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, VectorIndex};
    use crate::embedder::mock::MockEmbedder;
    use crate::llm::mock::{ScriptedChatModel, text_reply};
    use crate::llm::{ChatError, ChatModel, ChatResponse, Message, ToolSpec};
    use crate::rag::RagSettings;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    struct SlowModel(Duration);

    impl ChatModel for SlowModel {
        fn respond(&self, _: &str, _: &[Message], _: &[ToolSpec]) -> Result<ChatResponse, ChatError> {
            std::thread::sleep(self.0);
            Ok(text_reply("too late"))
        }
    }

    fn corpus() -> TempDir {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("chapter1_intro.md"),
            "---\ntitle: Intro\nurl: https://e.com/1\n---\n## Install\nRun the installer.\n",
        )
        .unwrap();
        dir
    }

    fn state(dir: &TempDir, model: Arc<dyn ChatModel>, timeout: Duration) -> AppState {
        let index: Arc<Mutex<dyn VectorIndex>> =
            Arc::new(Mutex::new(Db::open_in_memory(384).unwrap()));
        let settings = RagSettings {
            chapters_dir: dir.path().to_path_buf(),
            default_top_k: 3,
            max_tool_iterations: 5,
            use_tools: false,
            embed_batch_size: 10,
        };
        AppState {
            rag: Arc::new(RagSystem::new(
                settings,
                Arc::new(MockEmbedder::default()),
                index,
                model,
            )),
            timeout,
        }
    }

    fn ask(question: &str) -> Json<QueryRequest> {
        Json(QueryRequest {
            question: question.to_string(),
            use_tools: None,
        })
    }

    #[tokio::test]
    async fn test_empty_question_is_400() {
        let dir = corpus();
        let model = Arc::new(ScriptedChatModel::default());
        let st = state(&dir, model.clone(), Duration::from_secs(5));

        let err = handle_query(State(st), ask("   ")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.detail, "Question cannot be empty");
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_query_before_initialize_is_503() {
        let dir = corpus();
        let st = state(&dir, Arc::new(ScriptedChatModel::default()), Duration::from_secs(5));

        let err = handle_query(State(st), ask("hello")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_initialize_then_query() {
        let dir = corpus();
        let model = Arc::new(ScriptedChatModel::new([text_reply("Run the installer.")]));
        let st = state(&dir, model, Duration::from_secs(5));

        let Json(health) = handle_health(State(st.clone())).await;
        assert!(!health.rag_initialized);

        let Json(report) = handle_initialize(State(st.clone())).await.unwrap();
        assert_eq!(report.status, "success");
        assert_eq!(report.passages_indexed, 1);

        let Json(health) = handle_health(State(st.clone())).await;
        assert_eq!(health.status, "healthy");
        assert!(health.rag_initialized);

        let Json(resp) = handle_query(State(st), ask("how do I install?")).await.unwrap();
        assert_eq!(resp.answer, "Run the installer.");
        assert_eq!(resp.context_count, 1);
        assert_eq!(resp.sources[0].chapter, "chapter1_intro");
        assert_eq!(resp.sources[0].url, "https://e.com/1");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_opaque_500() {
        let dir = corpus();
        // No scripted responses: the model call fails.
        let st = state(&dir, Arc::new(ScriptedChatModel::default()), Duration::from_secs(5));
        handle_initialize(State(st.clone())).await.unwrap();

        let err = handle_query(State(st), ask("hello")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail, "Error processing query");
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        let dir = corpus();
        let st = state(
            &dir,
            Arc::new(SlowModel(Duration::from_millis(500))),
            Duration::from_secs(5),
        );
        handle_initialize(State(st.clone())).await.unwrap();
        let st = AppState {
            timeout: Duration::from_millis(50),
            ..st
        };

        let err = handle_query(State(st), ask("hello")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.detail, "Request timed out");
    }

    #[tokio::test]
    async fn test_initialize_empty_corpus() {
        let dir = tempdir().unwrap();
        let st = state(&dir, Arc::new(ScriptedChatModel::default()), Duration::from_secs(5));

        let err = handle_initialize(State(st)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.detail.contains("No markdown files found"));
    }

    #[test]
    fn test_error_body_shape() {
        let err = AppError::from_rag(RagError::Validation("bad".into()), "x");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
