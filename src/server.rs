//! HTTP surface over the orchestrator and the apply pipeline.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::error::{Error, Result};
use crate::orchestrator::ProjectOrchestrator;
use crate::pipeline::{ApplyPipeline, ApplyRequest};
use crate::progress::{self, ProgressEvent};
use crate::sandbox::SandboxSession;

/// Shared handler state.
pub struct AppState {
    pub orchestrator: ProjectOrchestrator,
    pub pipeline: ApplyPipeline,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize)]
pub struct AutoSaveRequest {
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub from: u64,
    pub to: u64,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Upstream(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let message = e.to_string();
        match e {
            Error::ProjectNotFound(_) | Error::VersionNotFound { .. } => ApiError::NotFound(message),
            Error::SandboxUnavailable { .. } | Error::InvalidTransition { .. } => {
                ApiError::Conflict(message)
            }
            Error::MalformedPackageName { .. } | Error::InvalidId(_) | Error::Config(_) => {
                ApiError::BadRequest(message)
            }
            Error::ReconnectFailure { .. }
            | Error::SandboxCreation(_)
            | Error::Remote(_)
            | Error::Storage(_)
            | Error::Http(_) => ApiError::Upstream(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/projects/{id}/open", post(open_project))
        .route("/api/projects/{id}/save", post(save_project))
        .route("/api/projects/{id}/sync", post(sync_project))
        .route("/api/projects/{id}/autosave", post(auto_save))
        .route("/api/projects/{id}/compare", get(compare_versions))
        .route("/api/sandbox", get(sandbox_status).delete(destroy_sandbox))
        .route("/api/sandbox/restart", post(restart_sandbox))
        .route("/api/apply", post(apply))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Binds `addr` and serves until Ctrl+C, then flushes pending saves.
pub async fn serve(state: SharedState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.pipeline.flush_pending_sync().await;
    state.orchestrator.close().await?;
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn open_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let opened = state.orchestrator.open_project(&id).await?;
    Ok(Json(opened))
}

async fn sandbox_status(
    State(state): State<SharedState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let session = state
        .orchestrator
        .current_session()
        .await
        .ok_or_else(|| ApiError::NotFound("no sandbox".into()))?;
    Ok(Json(session.snapshot().await))
}

async fn destroy_sandbox(
    State(state): State<SharedState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    state.pipeline.flush_pending_sync().await;
    state.orchestrator.close().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_sandbox(
    State(state): State<SharedState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let session = state
        .orchestrator
        .current_session()
        .await
        .ok_or_else(|| ApiError::Conflict("no sandbox".into()))?;
    session.restart().await?;
    Ok(Json(session.snapshot().await))
}

/// Returns the session of `project_id` if that project is the open one.
async fn open_session(state: &AppState, project_id: &str) -> std::result::Result<Arc<SandboxSession>, ApiError> {
    if state.orchestrator.current_project().await.as_deref() != Some(project_id) {
        return Err(ApiError::Conflict(format!("project {} is not open", project_id)));
    }
    state
        .orchestrator
        .current_session()
        .await
        .ok_or_else(|| ApiError::Conflict("no sandbox".into()))
}

async fn save_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let session = open_session(&state, &id).await?;
    let project = state
        .orchestrator
        .sync()
        .save_from_sandbox(&session, &id)
        .await?;
    Ok(Json(project))
}

async fn sync_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let session = open_session(&state, &id).await?;
    let outcome = state
        .orchestrator
        .sync()
        .sync_to_sandbox(&session, &id)
        .await?;
    Ok(Json(outcome))
}

async fn auto_save(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<AutoSaveRequest>,
) -> impl IntoResponse {
    let status = state.orchestrator.sync().auto_save(&id, request.files).await;
    (StatusCode::ACCEPTED, Json(status))
}

async fn compare_versions(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<CompareQuery>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let comparison = state
        .orchestrator
        .sync()
        .compare_versions(&id, query.from, query.to)
        .await?;
    Ok(Json(comparison))
}

/// Runs the pipeline in a task and streams its progress as NDJSON.
async fn apply(State(state): State<SharedState>, Json(request): Json<ApplyRequest>) -> Response {
    let (tx, rx) = progress::channel(progress::DEFAULT_CAPACITY);

    tokio::spawn(async move {
        let session = state
            .orchestrator
            .session_for(request.project_id.as_deref())
            .await;
        if let Err(abort) = state.pipeline.apply(&session, request, &tx).await {
            if !abort.parsed_files.is_empty() {
                tx.status(format!(
                    "parsed but not written: {}",
                    abort.parsed_files.join(", ")
                ))
                .await;
            }
        }
    });

    let body = ReceiverStream::new(rx).map(|event: ProgressEvent| event.to_ndjson());
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplyConfig, PackagesConfig, SandboxConfig, SyncConfig};
    use crate::project::{MemoryProjectStore, ProjectSync};
    use crate::sandbox::MemorySandboxProvider;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let provider = Arc::new(MemorySandboxProvider::default());
        let store = Arc::new(MemoryProjectStore::new());
        let sync = Arc::new(ProjectSync::new(store, SyncConfig::default()));
        let config = SandboxConfig {
            health_check_interval_secs: 0,
            ..SandboxConfig::default()
        };
        let state = Arc::new(AppState {
            orchestrator: ProjectOrchestrator::new(provider, config, Arc::clone(&sync)),
            pipeline: ApplyPipeline::new(ApplyConfig::default(), PackagesConfig::default())
                .with_sync(sync),
        });
        router(state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn ndjson(response: Response) -> Vec<serde_json::Value> {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let app = test_app();
        let response = send(&app, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn open_project_then_inspect_sandbox() {
        let app = test_app();

        let response = send(&app, "POST", "/api/projects/p1/open", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let opened = body_json(response).await;
        assert_eq!(opened["projectId"], "p1");
        assert_eq!(opened["sandbox"]["status"], "running");
        assert_eq!(opened["sync"]["skipped"], true);

        let response = send(&app, "GET", "/api/sandbox", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "running");
    }

    #[tokio::test]
    async fn sandbox_is_not_found_before_open() {
        let app = test_app();
        let response = send(&app, "GET", "/api/sandbox", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn apply_streams_ndjson_ending_in_complete() {
        let app = test_app();
        send(&app, "POST", "/api/projects/p1/open", None).await;

        let response = send(
            &app,
            "POST",
            "/api/apply",
            Some(serde_json::json!({
                "response": "<file path=\"src/App.jsx\">export default () => null;</file>",
                "projectId": "p1"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );

        let frames = ndjson(response).await;
        assert_eq!(frames[0]["type"], "start");
        let last = frames.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["result"]["filesCreated"][0], "src/App.jsx");
    }

    #[tokio::test]
    async fn apply_without_sandbox_streams_error() {
        let app = test_app();
        let response = send(
            &app,
            "POST",
            "/api/apply",
            Some(serde_json::json!({
                "response": "<file path=\"src/A.jsx\">a</file>",
                "sandboxId": "sb-missing"
            })),
        )
        .await;

        let frames = ndjson(response).await;
        let error = frames.iter().find(|f| f["type"] == "error").unwrap();
        assert_eq!(error["kind"], "reconnect_failure");
        assert!(frames.iter().all(|f| f["type"] != "complete"));
        assert!(frames.last().unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("src/A.jsx"));
    }

    #[tokio::test]
    async fn save_requires_open_project() {
        let app = test_app();
        let response = send(&app, "POST", "/api/projects/p1/save", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        send(&app, "POST", "/api/projects/p1/open", None).await;
        let response = send(&app, "POST", "/api/projects/p1/save", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["version"], 1);
    }

    #[tokio::test]
    async fn compare_unknown_project_is_not_found() {
        let app = test_app();
        let response = send(&app, "GET", "/api/projects/nope/compare?from=1&to=2", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn autosave_of_empty_files_is_rejected() {
        let app = test_app();
        let response = send(
            &app,
            "POST",
            "/api/projects/p1/autosave",
            Some(serde_json::json!({ "files": { "src/A.jsx": "   " } })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["status"], "rejected");
    }

    #[tokio::test]
    async fn delete_sandbox_destroys_session() {
        let app = test_app();
        send(&app, "POST", "/api/projects/p1/open", None).await;

        let response = send(&app, "DELETE", "/api/sandbox", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&app, "GET", "/api/sandbox", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
