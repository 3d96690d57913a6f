//! Capability interface over the sandbox SDK.
//!
//! The gateway only ever talks to sandboxes through [`SandboxBackend`] and
//! [`SandboxHandle`]. Which implementation backs them is decided once at
//! startup from [`BackendKind`].

pub mod isolate;
pub mod mock;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::GatewayConfig;

/// Failure reported by a sandbox backend. Carries the message only.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SdkError {
    message: String,
}

impl SdkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type SdkResult<T> = std::result::Result<T, SdkError>;

/// Factory for new sandboxes.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Instantiate a fresh sandbox.
    async fn create(&self) -> SdkResult<Arc<dyn SandboxHandle>>;
}

/// A live sandbox.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Identifier issued by the backend at creation time.
    fn id(&self) -> &str;

    /// Free-form status record (status, host, ...).
    async fn info(&self) -> SdkResult<Value>;

    async fn execute_command(&self, command: &str) -> SdkResult<String>;

    async fn run_code(&self, language: &str, code: &str) -> SdkResult<String>;

    /// Write inline text to `remote_path` inside the sandbox.
    async fn write_file(&self, content: &str, remote_path: &str) -> SdkResult<()>;

    /// Copy a local file into the sandbox.
    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> SdkResult<()>;

    /// Copy a sandbox file to `local_path`. A missing remote file may leave
    /// `local_path` absent without returning an error.
    async fn download_file(&self, remote_path: &str, local_path: &Path) -> SdkResult<()>;

    /// Tear the sandbox down.
    async fn stop(&self) -> SdkResult<()>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// In-memory double, no real execution.
    Mock,
    /// Sessions API of an isolate sandbox server.
    Isolate,
}

/// Build the backend named in the configuration.
pub fn build_backend(config: &GatewayConfig) -> SdkResult<Arc<dyn SandboxBackend>> {
    match config.backend {
        BackendKind::Mock => Ok(Arc::new(mock::MockBackend::new())),
        BackendKind::Isolate => Ok(Arc::new(isolate::IsolateBackend::new(&config.isolate_url)?)),
    }
}
