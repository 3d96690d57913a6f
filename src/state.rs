//! Shared application state and the sandbox registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::RwLock;

use crate::config::GatewayConfig;
use crate::sdk::{SandboxBackend, SandboxHandle};

/// A registered sandbox: its live handle plus the local directory used to
/// stage file transfers. Both are created and dropped together.
pub struct SandboxEntry {
    pub handle: Arc<dyn SandboxHandle>,
    pub scratch: TempDir,
}

impl SandboxEntry {
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Identifier → entry map. The lock is only held for map access, never
/// across SDK calls.
pub struct SandboxRegistry {
    entries: RwLock<HashMap<String, SandboxEntry>>,
    scratch_root: PathBuf,
}

impl SandboxRegistry {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            scratch_root: scratch_root.into(),
        }
    }

    /// Register a handle under its own id with a fresh scratch directory.
    ///
    /// Returns the handle back if the id is already taken.
    pub async fn register(
        &self,
        handle: Arc<dyn SandboxHandle>,
    ) -> Result<PathBuf, RegisterError> {
        let id = handle.id().to_string();
        let scratch = tokio::task::spawn_blocking({
            let root = self.scratch_root.clone();
            let prefix = format!("sbx_{id}_");
            move || {
                std::fs::create_dir_all(&root)?;
                tempfile::Builder::new().prefix(&prefix).tempdir_in(&root)
            }
        })
        .await
        .map_err(|e| RegisterError::Io(std::io::Error::other(e)))?
        .map_err(RegisterError::Io)?;

        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(RegisterError::Duplicate(handle));
        }
        let dir = scratch.path().to_path_buf();
        entries.insert(id, SandboxEntry { handle, scratch });
        Ok(dir)
    }

    pub async fn handle(&self, id: &str) -> Option<Arc<dyn SandboxHandle>> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.handle))
    }

    pub async fn scratch_dir(&self, id: &str) -> Option<PathBuf> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.scratch_dir().to_path_buf())
    }

    /// Handle and scratch directory in one lookup.
    pub async fn lookup(&self, id: &str) -> Option<(Arc<dyn SandboxHandle>, PathBuf)> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| (Arc::clone(&entry.handle), entry.scratch_dir().to_path_buf()))
    }

    pub async fn remove(&self, id: &str) -> Option<SandboxEntry> {
        self.entries.write().await.remove(id)
    }

    pub async fn drain(&self) -> Vec<(String, SandboxEntry)> {
        self.entries.write().await.drain().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub enum RegisterError {
    Duplicate(Arc<dyn SandboxHandle>),
    Io(std::io::Error),
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SandboxRegistry>,
    pub backend: Arc<dyn SandboxBackend>,
    /// Client for URL-based uploads.
    pub fetcher: reqwest::Client,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(config: GatewayConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            registry: Arc::new(SandboxRegistry::new(config.scratch_root.clone())),
            backend,
            fetcher: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }
}
