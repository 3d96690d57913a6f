//! HTTP server implementation using Axum.

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::{self, StopOutcome};
use crate::state::AppState;

// Request/Response types
#[derive(Deserialize)]
struct CreateRequest {
    #[serde(default)]
    conversation_id: String,
}

#[derive(Serialize)]
struct CreateResponse {
    sandbox_id: String,
    info: Value,
}

#[derive(Deserialize)]
struct SandboxIdRequest {
    sandbox_id: String,
}

#[derive(Deserialize)]
struct CommandRequest {
    sandbox_id: String,
    command: String,
}

#[derive(Deserialize)]
struct RunCodeRequest {
    sandbox_id: String,
    code: String,
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String { "py".to_string() }

#[derive(Deserialize)]
struct WriteFileRequest {
    sandbox_id: String,
    content: String,
    remote_path: String,
}

#[derive(Deserialize)]
struct UploadRequest {
    sandbox_id: String,
    file_url: String,
    remote_filename: String,
}

#[derive(Deserialize)]
struct DownloadRequest {
    sandbox_id: String,
    remote_path: String,
}

#[derive(Serialize)]
struct OutputResponse {
    output: String,
}

#[derive(Serialize)]
struct FileStatusResponse {
    status: &'static str,
    remote_path: String,
}

#[derive(Serialize)]
struct DownloadResponse {
    filename: String,
    download_url: String,
}

#[derive(Serialize)]
struct StopResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<StopOutcome> for StopResponse {
    fn from(outcome: StopOutcome) -> Self {
        match outcome {
            StopOutcome::Stopped => Self {
                status: "stopped",
                message: None,
            },
            StopOutcome::Failed(message) => Self {
                status: "error",
                message: Some(message),
            },
            StopOutcome::NotFound => Self {
                status: "not_found",
                message: None,
            },
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

/// Build the router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/create_sandbox", post(create_sandbox))
        .route("/get_sandbox_info", post(get_sandbox_info))
        .route("/execute_command", post(execute_command))
        .route("/run_code", post(run_code))
        .route("/write_file", post(write_file))
        .route("/upload_file", post(upload_file))
        .route("/download_file", post(download_file))
        .route("/stop_sandbox", post(stop_sandbox))
        // Staged files
        .route("/files/:sandbox_id/:filename", get(serve_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Run the HTTP server until a shutdown signal, then stop every sandbox
/// still registered.
pub async fn run_server(state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway::shutdown(&state).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "Sandbox gateway is running",
    })
}

async fn create_sandbox(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>> {
    let tag = Some(req.conversation_id.as_str()).filter(|t| !t.is_empty());
    let created = gateway::create_sandbox(&state, tag).await?;
    Ok(Json(CreateResponse {
        sandbox_id: created.sandbox_id,
        info: created.info,
    }))
}

async fn get_sandbox_info(
    State(state): State<AppState>,
    Json(req): Json<SandboxIdRequest>,
) -> Result<Json<Value>> {
    Ok(Json(gateway::sandbox_info(&state, &req.sandbox_id).await?))
}

async fn execute_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<OutputResponse>> {
    let output = gateway::execute_command(&state, &req.sandbox_id, &req.command).await?;
    Ok(Json(OutputResponse { output }))
}

async fn run_code(
    State(state): State<AppState>,
    Json(req): Json<RunCodeRequest>,
) -> Result<Json<OutputResponse>> {
    let output = gateway::run_code(&state, &req.sandbox_id, &req.code, &req.language).await?;
    Ok(Json(OutputResponse { output }))
}

async fn write_file(
    State(state): State<AppState>,
    Json(req): Json<WriteFileRequest>,
) -> Result<Json<FileStatusResponse>> {
    let remote_path =
        gateway::write_file(&state, &req.sandbox_id, &req.content, &req.remote_path).await?;
    Ok(Json(FileStatusResponse { status: "success", remote_path }))
}

async fn upload_file(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<FileStatusResponse>> {
    let remote_path =
        gateway::upload_file(&state, &req.sandbox_id, &req.file_url, &req.remote_filename).await?;
    Ok(Json(FileStatusResponse { status: "success", remote_path }))
}

async fn download_file(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>> {
    let staged = gateway::download_file(&state, &req.sandbox_id, &req.remote_path).await?;
    Ok(Json(DownloadResponse {
        filename: staged.filename,
        download_url: staged.download_url,
    }))
}

async fn stop_sandbox(
    State(state): State<AppState>,
    Json(req): Json<SandboxIdRequest>,
) -> Json<StopResponse> {
    Json(gateway::stop_sandbox(&state, &req.sandbox_id).await.into())
}

async fn serve_file(
    State(state): State<AppState>,
    Path((sandbox_id, filename)): Path<(String, String)>,
) -> Result<Response> {
    let path = gateway::staged_file(&state, &sandbox_id, &filename).await?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => GatewayError::NotFound("File not found".to_string()),
        _ => e.into(),
    })?;
    let disposition = HeaderValue::from_str(&content_disposition(&filename))
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// `attachment` disposition; non-token names use the RFC 5987 form.
fn content_disposition(filename: &str) -> String {
    let encoded = urlencoding::encode(filename);
    if encoded == filename {
        format!("attachment; filename=\"{filename}\"")
    } else {
        format!("attachment; filename*=utf-8''{encoded}")
    }
}
