//! In-memory sandbox backend.
//!
//! Nothing is executed. Commands and code are echoed back, files live in a
//! per-sandbox map so write/upload followed by download round-trips.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{SandboxBackend, SandboxHandle, SdkError, SdkResult};

const SUPPORTED_LANGUAGES: &[&str] = &["py", "python", "js", "javascript", "node", "sh", "bash"];

#[derive(Debug, Default)]
pub struct MockBackend {
    fail_create: bool,
    fail_stop: bool,
    fail_upload: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create` call fails.
    pub fn with_failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// Sandboxes from this backend fail to stop.
    pub fn with_failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    /// Sandboxes from this backend reject every `upload_file`.
    pub fn with_failing_upload() -> Self {
        Self {
            fail_upload: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    async fn create(&self) -> SdkResult<Arc<dyn SandboxHandle>> {
        if self.fail_create {
            return Err(SdkError::new("mock backend refused to create a sandbox"));
        }
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        debug!(sandbox_id = %id, "mock sandbox created");
        Ok(Arc::new(MockSandbox {
            id,
            files: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            fail_stop: self.fail_stop,
            fail_upload: self.fail_upload,
        }))
    }
}

#[derive(Debug)]
pub struct MockSandbox {
    id: String,
    files: Mutex<HashMap<String, Vec<u8>>>,
    stopped: AtomicBool,
    fail_stop: bool,
    fail_upload: bool,
}

impl MockSandbox {
    fn store(&self, remote_path: &str, bytes: Vec<u8>) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote_path.to_string(), bytes);
    }

    fn load(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote_path)
            .cloned()
    }

    fn ensure_running(&self) -> SdkResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SdkError::new(format!("sandbox {} is stopped", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxHandle for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn info(&self) -> SdkResult<Value> {
        let status = if self.stopped.load(Ordering::SeqCst) {
            "stopped"
        } else {
            "running"
        };
        Ok(json!({ "id": self.id, "status": status, "host": "127.0.0.1" }))
    }

    async fn execute_command(&self, command: &str) -> SdkResult<String> {
        self.ensure_running()?;
        if command.trim().is_empty() {
            return Err(SdkError::new("empty command"));
        }
        Ok(format!("Mock Exec: {command}"))
    }

    async fn run_code(&self, language: &str, code: &str) -> SdkResult<String> {
        self.ensure_running()?;
        if !SUPPORTED_LANGUAGES.contains(&language) {
            return Err(SdkError::new(format!("unsupported language: {language}")));
        }
        Ok(format!("Mock Run {language}: {code}"))
    }

    async fn write_file(&self, content: &str, remote_path: &str) -> SdkResult<()> {
        self.ensure_running()?;
        self.store(remote_path, content.as_bytes().to_vec());
        Ok(())
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> SdkResult<()> {
        self.ensure_running()?;
        if self.fail_upload {
            return Err(SdkError::new(format!("mock upload rejected {remote_path}")));
        }
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| SdkError::new(format!("read {}: {e}", local_path.display())))?;
        self.store(remote_path, bytes);
        Ok(())
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> SdkResult<()> {
        self.ensure_running()?;
        if let Some(bytes) = self.load(remote_path) {
            tokio::fs::write(local_path, bytes)
                .await
                .map_err(|e| SdkError::new(format!("write {}: {e}", local_path.display())))?;
        }
        Ok(())
    }

    async fn stop(&self) -> SdkResult<()> {
        if self.fail_stop {
            return Err(SdkError::new(format!("failed to stop sandbox {}", self.id)));
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(SdkError::new(format!("sandbox {} already stopped", self.id)));
        }
        Ok(())
    }
}
