//! Gateway operations: one function per SDK capability.
//!
//! Every function looks the sandbox up in the registry, makes exactly one
//! SDK call, and maps the outcome into [`GatewayError`]. Nothing is retried.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Url;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::WORKSPACE_DIR;
use crate::error::{GatewayError, Result};
use crate::sdk::SandboxHandle;
use crate::state::{AppState, RegisterError, SandboxEntry};

/// A freshly created sandbox.
#[derive(Debug)]
pub struct CreatedSandbox {
    pub sandbox_id: String,
    pub info: Value,
}

/// A sandbox file staged locally and reachable over HTTP.
#[derive(Debug)]
pub struct StagedDownload {
    pub filename: String,
    pub download_url: String,
}

/// Result of a stop request. Never an error: local cleanup has already
/// happened by the time the SDK is asked to stop.
#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    Failed(String),
    NotFound,
}

async fn handle_or_404(state: &AppState, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>> {
    state
        .registry
        .handle(sandbox_id)
        .await
        .ok_or_else(|| GatewayError::sandbox_not_found(sandbox_id))
}

async fn lookup_or_404(
    state: &AppState,
    sandbox_id: &str,
) -> Result<(Arc<dyn SandboxHandle>, PathBuf)> {
    state
        .registry
        .lookup(sandbox_id)
        .await
        .ok_or_else(|| GatewayError::sandbox_not_found(sandbox_id))
}

/// Final path component, if it is a normal file name.
fn base_filename(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

fn is_plain_filename(name: &str) -> bool {
    base_filename(name).as_deref() == Some(name)
}

fn download_url(host_url: &str, sandbox_id: &str, filename: &str) -> Result<String> {
    let mut url = Url::parse(host_url)
        .map_err(|e| GatewayError::Internal(format!("invalid host URL '{host_url}': {e}")))?;
    url.path_segments_mut()
        .map_err(|()| GatewayError::Internal(format!("host URL '{host_url}' cannot be a base")))?
        .pop_if_empty()
        .extend(["files", sandbox_id, filename]);
    Ok(url.into())
}

pub async fn create_sandbox(state: &AppState, tag: Option<&str>) -> Result<CreatedSandbox> {
    let handle = state.backend.create().await?;
    let sandbox_id = handle.id().to_string();

    let info = match handle.info().await {
        Ok(info) => info,
        Err(e) => {
            discard(&handle).await;
            return Err(e.into());
        }
    };

    match state.registry.register(Arc::clone(&handle)).await {
        Ok(scratch_dir) => {
            info!(
                sandbox_id = %sandbox_id,
                conversation_id = tag.unwrap_or_default(),
                scratch_dir = %scratch_dir.display(),
                "Created sandbox"
            );
            Ok(CreatedSandbox { sandbox_id, info })
        }
        Err(RegisterError::Duplicate(_)) => {
            discard(&handle).await;
            Err(GatewayError::Internal(format!(
                "sandbox id {sandbox_id} is already registered"
            )))
        }
        Err(RegisterError::Io(e)) => {
            discard(&handle).await;
            Err(e.into())
        }
    }
}

/// Stop a sandbox that never made it into the registry.
async fn discard(handle: &Arc<dyn SandboxHandle>) {
    if let Err(e) = handle.stop().await {
        warn!(sandbox_id = %handle.id(), error = %e, "failed to stop unregistered sandbox");
    }
}

pub async fn sandbox_info(state: &AppState, sandbox_id: &str) -> Result<Value> {
    let handle = handle_or_404(state, sandbox_id).await?;
    Ok(handle.info().await?)
}

pub async fn execute_command(state: &AppState, sandbox_id: &str, command: &str) -> Result<String> {
    let handle = handle_or_404(state, sandbox_id).await?;
    Ok(handle.execute_command(command).await?)
}

pub async fn run_code(
    state: &AppState,
    sandbox_id: &str,
    code: &str,
    language: &str,
) -> Result<String> {
    let handle = handle_or_404(state, sandbox_id).await?;
    Ok(handle.run_code(language, code).await?)
}

pub async fn write_file(
    state: &AppState,
    sandbox_id: &str,
    content: &str,
    remote_path: &str,
) -> Result<String> {
    let handle = handle_or_404(state, sandbox_id).await?;
    handle.write_file(content, remote_path).await?;
    Ok(remote_path.to_string())
}

/// Fetch `file_url` into the scratch directory, push it into the sandbox
/// under the workspace directory, and return the sandbox-side path.
///
/// Once the fetched bytes are staged, the staging copy is removed whether or
/// not the SDK upload succeeded. A fetch failure leaves the scratch directory
/// untouched.
pub async fn upload_file(
    state: &AppState,
    sandbox_id: &str,
    file_url: &str,
    remote_filename: &str,
) -> Result<String> {
    let (handle, scratch_dir) = lookup_or_404(state, sandbox_id).await?;
    let staged_name = base_filename(remote_filename)
        .ok_or_else(|| GatewayError::Internal(format!("invalid filename '{remote_filename}'")))?;
    let local_path = scratch_dir.join(&staged_name);
    let remote_path = format!("{WORKSPACE_DIR}/{remote_filename}");

    let mut staged = false;
    let result = async {
        let bytes = fetch(state, file_url).await?;
        staged = true;
        tokio::fs::write(&local_path, &bytes).await?;
        handle.upload_file(&local_path, &remote_path).await?;
        Ok::<_, GatewayError>(())
    }
    .await;

    if staged {
        if let Err(e) = remove_if_present(&local_path).await {
            warn!(sandbox_id, path = %local_path.display(), error = %e, "failed to remove staged upload");
        }
    }

    result?;
    info!(sandbox_id, file_url, remote_path = %remote_path, "Uploaded file");
    Ok(remote_path)
}

async fn fetch(state: &AppState, url: &str) -> Result<Vec<u8>> {
    let response = state.fetcher.get(url).send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Pull a sandbox file into the scratch directory and return a link to it.
pub async fn download_file(
    state: &AppState,
    sandbox_id: &str,
    remote_path: &str,
) -> Result<StagedDownload> {
    let (handle, scratch_dir) = lookup_or_404(state, sandbox_id).await?;
    let filename = base_filename(remote_path)
        .ok_or_else(|| GatewayError::Internal(format!("invalid remote path '{remote_path}'")))?;
    let local_path = scratch_dir.join(&filename);

    // A stale copy from an earlier download must not pass for this one.
    remove_if_present(&local_path).await?;
    handle.download_file(remote_path, &local_path).await?;

    if !tokio::fs::try_exists(&local_path).await.unwrap_or(false) {
        return Err(GatewayError::NotFound(
            "File failed to download from sandbox".to_string(),
        ));
    }

    let download_url = download_url(&state.config.host_url, sandbox_id, &filename)?;
    info!(sandbox_id, remote_path, download_url = %download_url, "Staged download");
    Ok(StagedDownload {
        filename,
        download_url,
    })
}

pub async fn stop_sandbox(state: &AppState, sandbox_id: &str) -> StopOutcome {
    let Some(entry) = state.registry.remove(sandbox_id).await else {
        return StopOutcome::NotFound;
    };
    let outcome = teardown(sandbox_id, entry).await;
    info!(sandbox_id, outcome = ?outcome, "Stopped sandbox");
    outcome
}

/// Delete the scratch directory, then stop the sandbox.
async fn teardown(sandbox_id: &str, entry: SandboxEntry) -> StopOutcome {
    let SandboxEntry { handle, scratch } = entry;

    let removed = tokio::task::spawn_blocking(move || scratch.close()).await;
    match removed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(sandbox_id, error = %e, "failed to remove scratch directory"),
        Err(e) => warn!(sandbox_id, error = %e, "scratch cleanup task failed"),
    }

    match handle.stop().await {
        Ok(()) => StopOutcome::Stopped,
        Err(e) => {
            warn!(sandbox_id, error = %e, "sandbox stop failed");
            StopOutcome::Failed(e.to_string())
        }
    }
}

/// Path of a staged file, if both the sandbox and the file exist.
pub async fn staged_file(state: &AppState, sandbox_id: &str, filename: &str) -> Result<PathBuf> {
    let scratch_dir = state
        .registry
        .scratch_dir(sandbox_id)
        .await
        .ok_or_else(|| GatewayError::NotFound("Sandbox not found".to_string()))?;
    if !is_plain_filename(filename) {
        return Err(GatewayError::NotFound("File not found".to_string()));
    }
    let path = scratch_dir.join(filename);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Ok(path),
        _ => Err(GatewayError::NotFound("File not found".to_string())),
    }
}

/// Stop every registered sandbox. Used when the server shuts down.
pub async fn shutdown(state: &AppState) {
    let entries = state.registry.drain().await;
    if entries.is_empty() {
        return;
    }
    info!(count = entries.len(), "Stopping remaining sandboxes");
    for (sandbox_id, entry) in entries {
        teardown(&sandbox_id, entry).await;
    }
}
