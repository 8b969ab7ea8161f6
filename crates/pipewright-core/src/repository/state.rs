//! State store trait definition and the in-memory backend.
//!
//! The store owns the durable copy of every `WorkflowState`. The
//! infrastructure layer (pipewright-infra) implements this trait with atomic
//! filesystem writes; `MemoryStateStore` keeps serialized snapshots in a map
//! and backs the orchestrator tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use pipewright_types::error::StoreError;
use pipewright_types::state::{STATE_SCHEMA_VERSION, WorkflowState};

/// Durable storage for run snapshots.
///
/// `save` replaces the whole snapshot for `state.workflow_id`. A reader
/// must only ever observe a complete snapshot, never a partial write.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateStore: Send + Sync {
    /// Load a snapshot. `Ok(None)` when no run with this id exists.
    fn load(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowState>, StoreError>> + Send;

    /// Persist a full snapshot, replacing any previous one.
    fn save(
        &self,
        state: &WorkflowState,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// All readable snapshots, ordered by workflow id.
    fn list(&self) -> impl std::future::Future<Output = Result<Vec<WorkflowState>, StoreError>> + Send;

    /// Drop the snapshot for `workflow_id`. `Ok(false)` when there was none.
    fn delete(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;
}

/// Decode a serialized snapshot, rejecting unreadable JSON and unknown
/// schema versions as corruption.
pub fn decode_snapshot(workflow_id: &str, raw: &str) -> Result<WorkflowState, StoreError> {
    let state: WorkflowState = serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        workflow_id: workflow_id.to_string(),
        reason: e.to_string(),
    })?;
    if state.schema_version != STATE_SCHEMA_VERSION {
        return Err(StoreError::Corrupt {
            workflow_id: workflow_id.to_string(),
            reason: format!(
                "unsupported schema version {} (expected {})",
                state.schema_version, STATE_SCHEMA_VERSION
            ),
        });
    }
    if state.workflow_id != workflow_id {
        return Err(StoreError::Corrupt {
            workflow_id: workflow_id.to_string(),
            reason: format!("snapshot belongs to workflow '{}'", state.workflow_id),
        });
    }
    Ok(state)
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory `StateStore`.
///
/// Snapshots are stored as JSON so loads go through the same decoding path
/// as the durable backend. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    snapshots: Arc<DashMap<String, String>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Raw serialized snapshot, if any.
    pub fn raw(&self, workflow_id: &str) -> Option<String> {
        self.snapshots.get(workflow_id).map(|s| s.value().clone())
    }

    /// Overwrite the stored bytes for `workflow_id` without validation.
    pub fn put_raw(&self, workflow_id: &str, raw: impl Into<String>) {
        self.snapshots.insert(workflow_id.to_string(), raw.into());
    }
}

impl StateStore for MemoryStateStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let Some(raw) = self.raw(workflow_id) else {
            return Ok(None);
        };
        decode_snapshot(workflow_id, &raw).map(Some)
    }

    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(state)?;
        self.snapshots.insert(state.workflow_id.clone(), raw);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowState>, StoreError> {
        let mut ids: Vec<String> = self.snapshots.iter().map(|e| e.key().clone()).collect();
        ids.sort();

        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => tracing::warn!(workflow_id = %id, error = %e, "skipping unreadable snapshot"),
            }
        }
        Ok(states)
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool, StoreError> {
        Ok(self.snapshots.remove(workflow_id).is_some())
    }
}
