use super::GuardEntry;
use crate::lock;
use async_trait::async_trait;
use onionpath_common::{OnionError, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Where the guard list survives restarts
#[async_trait]
pub trait GuardStore: Send + Sync {
    async fn load_guards(&self) -> Result<Vec<GuardEntry>>;
    async fn save_guards(&self, guards: &[GuardEntry]) -> Result<()>;
}

/// Guards as a JSON array in one file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct JsonFileGuardStore {
    path: PathBuf,
}

impl JsonFileGuardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl GuardStore for JsonFileGuardStore {
    async fn load_guards(&self) -> Result<Vec<GuardEntry>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No guard file at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents)
            .map_err(|e| OnionError::storage(format!("{}: {}", self.path.display(), e)))
    }

    async fn save_guards(&self, guards: &[GuardEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(guards)
            .map_err(|e| OnionError::storage(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Saved {} guards to {}", guards.len(), self.path.display());
        Ok(())
    }
}

/// Guard list kept only for the life of the process
#[derive(Debug, Default)]
pub struct MemoryGuardStore {
    guards: Mutex<Vec<GuardEntry>>,
}

impl MemoryGuardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guards(guards: Vec<GuardEntry>) -> Self {
        Self {
            guards: Mutex::new(guards),
        }
    }

    pub fn snapshot(&self) -> Vec<GuardEntry> {
        lock(&self.guards).clone()
    }
}

#[async_trait]
impl GuardStore for MemoryGuardStore {
    async fn load_guards(&self) -> Result<Vec<GuardEntry>> {
        Ok(self.snapshot())
    }

    async fn save_guards(&self, guards: &[GuardEntry]) -> Result<()> {
        *lock(&self.guards) = guards.to_vec();
        Ok(())
    }
}
