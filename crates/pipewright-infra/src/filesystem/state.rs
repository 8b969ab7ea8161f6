//! Durable `StateStore` backed by one JSON file per workflow run.
//!
//! Layout: `{base_dir}/{workflow_id}/state/workflow_state.json`, which is the
//! `state/` directory of the run's workspace.
//!
//! Every save writes a fresh temp file in the same directory, fsyncs it and
//! renames it over the canonical file. Readers therefore see either the old
//! snapshot or the new one, never a torn write.

use std::io::Write;
use std::path::{Path, PathBuf};

use pipewright_core::repository::state::{StateStore, decode_snapshot};
pub use pipewright_core::workspace::STATE_FILE;
use pipewright_types::error::StoreError;
use pipewright_types::state::WorkflowState;
use tempfile::NamedTempFile;

pub const STATE_DIR: &str = "state";

/// Filesystem implementation of [`StateStore`].
#[derive(Debug, Clone)]
pub struct FileStateStore {
    base_dir: PathBuf,
}

impl FileStateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Canonical snapshot path for a run.
    pub fn state_path(&self, workflow_id: &str) -> Result<PathBuf, StoreError> {
        if workflow_id.is_empty()
            || workflow_id == "."
            || workflow_id == ".."
            || workflow_id.contains(['/', '\\'])
        {
            return Err(StoreError::Internal(format!(
                "invalid workflow id '{workflow_id}'"
            )));
        }
        Ok(self
            .base_dir
            .join(workflow_id)
            .join(STATE_DIR)
            .join(STATE_FILE))
    }
}

/// Write `bytes` to `path` via temp file + fsync + rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "state path has no parent")
    })?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // Make the rename itself durable. Not every platform lets a directory be
    // opened for syncing, so failures here are ignored.
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}

impl StateStore for FileStateStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let path = self.state_path(workflow_id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_snapshot(workflow_id, &raw).map(Some)
    }

    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let path = self.state_path(&state.workflow_id)?;
        let bytes = serde_json::to_vec_pretty(state)?;

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Internal(format!("state writer task failed: {e}")))??;

        tracing::debug!(
            workflow_id = %state.workflow_id,
            status = %state.status,
            "state snapshot saved"
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowState>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();

        let mut states = Vec::new();
        for id in ids {
            match self.load(&id).await {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(workflow_id = %id, error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(states)
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool, StoreError> {
        let path = self.state_path(workflow_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
