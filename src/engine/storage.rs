// State store abstraction for the engine
// One JSON snapshot document, replaced atomically on every save

//! # State Store
//!
//! The engine persists its run record as a single JSON document. The store
//! abstraction keeps the facade testable:
//!
//! - **StateStore trait**: `load` / `save` for the latest snapshot
//! - **JsonStateStore**: the production store; writes to a temporary file in
//!   the target directory and renames it into place, creating intermediate
//!   directories as needed
//! - **InMemoryStateStore**: for unit tests and ephemeral runs
//!
//! `load` on a fresh directory returns the distinguished
//! [`LatticeError::StateNotFound`] signal rather than a generic I/O error, so
//! callers can branch on first-run versus corrupted-state conditions.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::models::State;
use crate::{LatticeError, Result};

/// Persistence contract for the engine snapshot
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Load the latest persisted snapshot
    ///
    /// Returns [`LatticeError::StateNotFound`] when nothing was persisted
    /// yet; any other error is a real I/O or decode failure.
    async fn load(&self) -> Result<State>;

    /// Persist the snapshot atomically (write-temp + rename)
    async fn save(&self, state: &State) -> Result<()>;
}

/// Filesystem-backed store for `<workflow-dir>/engine/state.json`
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The conventional location under a workflow directory
    pub fn for_workflow_dir<P: AsRef<Path>>(workflow_dir: P) -> Self {
        Self {
            path: workflow_dir.as_ref().join("engine").join("state.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<State> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(LatticeError::StateNotFound(
                    self.path.display().to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, state: &State) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(state)?;

        let tmp = self.path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), run_id = %state.run_id, "state persisted");
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Option<State>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<State> {
        self.inner
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LatticeError::StateNotFound("in-memory".to_string()))
    }

    async fn save(&self, state: &State) -> Result<()> {
        *self.inner.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineStatus, WorkflowDefinition};
    use chrono::Utc;

    fn sample_state() -> State {
        State {
            run_id: "release-1".to_string(),
            workflow_id: "release".to_string(),
            definition: WorkflowDefinition::new("release"),
            status: EngineStatus::Blocked,
            status_reason: String::new(),
            runtime: Default::default(),
            nodes: Vec::new(),
            runnable: Vec::new(),
            skipped: Default::default(),
            runs: Default::default(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_file_is_distinguished_not_found() {
        let dir = std::env::temp_dir().join(format!("lattice-state-{}", uuid::Uuid::new_v4()));
        let store = JsonStateStore::for_workflow_dir(&dir);
        let err = store.load().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("lattice-state-{}", uuid::Uuid::new_v4()));
        let store = JsonStateStore::for_workflow_dir(&dir);

        let state = sample_state();
        store.save(&state).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.workflow_id, state.workflow_id);
        assert_eq!(loaded.status, EngineStatus::Blocked);

        // Save replaces the previous document in place
        let mut second = state.clone();
        second.status = EngineStatus::Running;
        store.save(&second).await.unwrap();
        assert_eq!(store.load().await.unwrap().status, EngineStatus::Running);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryStateStore::new();
        assert!(store.load().await.unwrap_err().is_not_found());
        store.save(&sample_state()).await.unwrap();
        assert_eq!(store.load().await.unwrap().run_id, "release-1");
    }
}
