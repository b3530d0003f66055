//! HTTP surface.
//!
//! Routes stay thin: they rate-limit, validate the body and hand off to the
//! session orchestrator or the snapshot manager.

use crate::engine::{AgentDeps, EventSink, Session, SessionRequest, SessionResult};
use crate::error::AgentError;
use crate::git_ops::{RollbackReport, SnapshotDiff, SnapshotManager};
use crate::rate_limit::FixedWindowLimiter;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    deps: AgentDeps,
    limiter: Arc<FixedWindowLimiter>,
}

impl AppState {
    pub fn new(deps: AgentDeps, limiter: FixedWindowLimiter) -> Self {
        Self {
            deps,
            limiter: Arc::new(limiter),
        }
    }

    /// Limiter sized from `rate_limit_per_minute`.
    pub fn from_deps(deps: AgentDeps) -> Self {
        let limiter = FixedWindowLimiter::per_minute(deps.config.rate_limit_per_minute);
        Self::new(deps, limiter)
    }

    fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(self.deps.workspace.root())
    }

    fn admit(&self, endpoint: &str) -> Result<(), ApiError> {
        self.limiter
            .check(endpoint)
            .map_err(|retry_after| ApiError::RateLimited(retry_after))
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    RateLimited(Duration),
    Agent(AgentError),
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        ApiError::Agent(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::RateLimited(retry_after) => {
                let secs = retry_after.as_secs().max(1);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "error": "Rate limit exceeded", "retryAfterSecs": secs })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            ApiError::Agent(err) => {
                let status = match err {
                    AgentError::PathEscape { .. } | AgentError::GitOperation { .. } => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Json(json!({ "error": err.to_string() }))).into_response()
            }
        }
    }
}

fn validate(request: &SessionRequest) -> Result<(), ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".to_string()));
    }
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "root": state.deps.workspace.root().display().to_string(),
    }))
}

async fn run_agent(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<SessionResult>, ApiError> {
    state.admit("agent")?;
    validate(&request)?;
    let session = Session::new(state.deps.clone());
    Ok(Json(session.run(request, EventSink::silent()).await))
}

async fn stream_agent(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.admit("agent-stream")?;
    validate(&request)?;

    let (sink, mut rx) = EventSink::channel();
    let session = Session::new(state.deps.clone());
    // A dropped client only stops consumption; the session runs to the end.
    tokio::spawn(async move {
        session.run(request, sink).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok(Event::default().event(event.name()).data(event.to_json()));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollbackBody {
    #[serde(alias = "commitHash", alias = "checkpointId")]
    checkpoint: String,
    #[serde(default, alias = "touchedFiles")]
    files: Vec<String>,
}

async fn rollback(
    State(state): State<AppState>,
    Json(body): Json<RollbackBody>,
) -> Result<Json<RollbackReport>, ApiError> {
    state.admit("rollback")?;
    if body.checkpoint.trim().is_empty() {
        return Err(ApiError::BadRequest("checkpoint is required".to_string()));
    }
    if body.files.is_empty() {
        return Err(ApiError::BadRequest("files must name at least one touched file".to_string()));
    }
    let report = state.snapshots().rollback(body.checkpoint.trim(), &body.files)?;
    Ok(Json(report))
}

async fn snapshot_diff(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<SnapshotDiff>, ApiError> {
    state.admit("diff")?;
    Ok(Json(state.snapshots().diff(&id)?))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/agent", post(run_agent))
        .route("/api/agent/stream", post(stream_agent))
        .route("/api/snapshots/rollback", post(rollback))
        .route("/api/snapshots/{id}/diff", get(snapshot_diff))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, root = %state.deps.workspace.root().display(), "listening");
    if let Err(err) = axum::serve(listener, router(state)).await {
        warn!(error = %err, "server stopped");
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::ManualClock;
    use crate::test_support::{deps, ScriptedLlm};
    use crate::workspace::Workspace;
    use std::path::Path as FsPath;
    use tempfile::tempdir;

    const CHAT_PLAN: &str = r#"{"intent":"chat","confidence":100,"steps":[{"action":"chat","message":"Hello there."}]}"#;

    async fn spawn(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn state(root: &FsPath, llm: Arc<ScriptedLlm>, limit: u32) -> AppState {
        let limiter = FixedWindowLimiter::new(limit, Duration::from_secs(60), Arc::new(ManualClock::new()));
        AppState::new(deps(root, llm), limiter)
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempdir().unwrap();
        let base = spawn(state(dir.path(), Arc::new(ScriptedLlm::new(Vec::<String>::new())), 5)).await;
        let body: serde_json::Value = reqwest::get(format!("{}/api/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_agent_runs_session_then_rate_limits() {
        let dir = tempdir().unwrap();
        let base = spawn(state(dir.path(), Arc::new(ScriptedLlm::new([CHAT_PLAN])), 1)).await;
        let client = reqwest::Client::new();

        let first = client
            .post(format!("{}/api/agent", base))
            .json(&json!({ "message": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 200);
        let body: serde_json::Value = first.json().await.unwrap();
        assert_eq!(body["status"], "completed");
        assert_eq!(body["message"], "Hello there.");

        let second = client
            .post(format!("{}/api/agent", base))
            .json(&json!({ "message": "again" }))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 429);
        assert!(second.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let dir = tempdir().unwrap();
        let base = spawn(state(dir.path(), Arc::new(ScriptedLlm::new(Vec::<String>::new())), 5)).await;
        let response = reqwest::Client::new()
            .post(format!("{}/api/agent", base))
            .json(&json!({ "message": "   " }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_stream_ends_with_done_event() {
        let dir = tempdir().unwrap();
        let base = spawn(state(dir.path(), Arc::new(ScriptedLlm::new([CHAT_PLAN])), 5)).await;
        let response = reqwest::Client::new()
            .post(format!("{}/api/agent/stream", base))
            .json(&json!({ "message": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let text = response.text().await.unwrap();

        let names: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect();
        assert_eq!(names.first(), Some(&"progress"));
        assert!(names.contains(&"plan"));
        assert!(names.contains(&"task-done"));
        assert_eq!(&names[names.len() - 2..], &["result", "done"]);
    }

    #[tokio::test]
    async fn test_diff_and_rollback_routes() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("src/App.tsx", "old\n").unwrap();
        let snapshot = SnapshotManager::new(dir.path()).checkpoint("before").unwrap();
        ws.write("src/App.tsx", "new\n").unwrap();
        ws.write("src/Extra.tsx", "extra\n").unwrap();

        let base = spawn(state(dir.path(), Arc::new(ScriptedLlm::new(Vec::<String>::new())), 5)).await;
        let client = reqwest::Client::new();

        let diff: serde_json::Value = client
            .get(format!("{}/api/snapshots/{}/diff", base, snapshot.commit_hash))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let files: Vec<&str> = diff["files"].as_array().unwrap().iter().filter_map(|v| v.as_str()).collect();
        assert!(files.contains(&"src/App.tsx"));

        let missing = client
            .post(format!("{}/api/snapshots/rollback", base))
            .json(&json!({ "checkpoint": snapshot.commit_hash, "files": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 400);

        let report: serde_json::Value = client
            .post(format!("{}/api/snapshots/rollback", base))
            .json(&json!({ "checkpoint": snapshot.commit_hash, "files": ["src/App.tsx"] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["restored"][0], "src/App.tsx");
        assert_eq!(ws.read("src/App.tsx").unwrap(), "old\n");
        assert_eq!(ws.read("src/Extra.tsx").unwrap(), "extra\n");
    }
}
