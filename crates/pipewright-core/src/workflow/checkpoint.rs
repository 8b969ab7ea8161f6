//! Durable checkpoint manager for workflow run state.
//!
//! Wraps a `StateStore` to provide a higher-level API for recording step
//! transitions. Every transition (pending -> in_progress -> completed/failed)
//! mutates the caller's `WorkflowState` and is persisted before the caller
//! moves on, so the durable snapshot always reflects the last completed
//! transition.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use pipewright_types::error::StoreError;
use pipewright_types::state::{
    AttemptRecord, StepResult, StepStatus, WorkflowState, WorkflowStatus,
};
use pipewright_types::workflow::WorkflowDefinition;

use crate::agent::StepFailure;
use crate::repository::state::StateStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Records run transitions through a `StateStore`.
///
/// Generic over `S: StateStore` so it works with any backend (filesystem,
/// in-memory).
pub struct CheckpointManager<S: StateStore> {
    store: S,
}

impl<S: StateStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn persist(&self, state: &mut WorkflowState) -> Result<(), CheckpointError> {
        state.touch();
        self.store
            .save(state)
            .await
            .map_err(|e| CheckpointError::from_store(&state.workflow_id, e))
    }

    fn step_mut<'s>(
        state: &'s mut WorkflowState,
        step_id: &str,
    ) -> Result<&'s mut StepResult, CheckpointError> {
        state
            .steps
            .get_mut(step_id)
            .ok_or_else(|| CheckpointError::UnknownStep(step_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Persist a freshly initialized run.
    pub async fn checkpoint_run_start(&self, state: &mut WorkflowState) -> Result<(), CheckpointError> {
        self.persist(state).await?;
        tracing::debug!(workflow_id = %state.workflow_id, steps = state.steps.len(), "checkpointed run start");
        Ok(())
    }

    /// Mark the run `Completed`.
    pub async fn checkpoint_run_complete(
        &self,
        state: &mut WorkflowState,
    ) -> Result<(), CheckpointError> {
        state.status = WorkflowStatus::Completed;
        state.current_step = None;
        state.completed_at = Some(Utc::now());
        self.persist(state).await?;
        tracing::debug!(workflow_id = %state.workflow_id, "checkpointed run complete");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Pending/Failed/InProgress -> InProgress, appending a new attempt.
    ///
    /// Returns the attempt number.
    pub async fn checkpoint_step_start(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
    ) -> Result<u32, CheckpointError> {
        let now = Utc::now();
        let step = Self::step_mut(state, step_id)?;
        let attempt_number = step.attempts.len() as u32 + 1;
        step.status = StepStatus::InProgress;
        step.started_at = Some(now);
        step.completed_at = None;
        step.produced_outputs.clear();
        step.attempts.push(AttemptRecord {
            attempt_number,
            error: None,
            error_kind: None,
            timestamp: now,
            completed_at: None,
            resource_usage: 0,
            agent_output: None,
        });

        state.status = WorkflowStatus::InProgress;
        state.current_step = Some(step_id.to_string());
        self.persist(state).await?;

        tracing::debug!(
            workflow_id = %state.workflow_id,
            step_id,
            attempt = attempt_number,
            "checkpointed step start"
        );
        Ok(attempt_number)
    }

    /// InProgress -> Completed. Clears `current_step`; the next
    /// `checkpoint_step_start` names the following step.
    pub async fn checkpoint_step_complete(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
        produced_outputs: BTreeMap<String, String>,
        resource_usage: u64,
        agent_output: Option<String>,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let step = Self::step_mut(state, step_id)?;
        step.status = StepStatus::Completed;
        step.completed_at = Some(now);
        step.produced_outputs = produced_outputs;
        if let Some(attempt) = step.last_attempt_mut() {
            attempt.completed_at = Some(now);
            attempt.resource_usage = resource_usage;
            attempt.agent_output = agent_output;
        }
        state.total_resource_usage += resource_usage;
        state.current_step = None;
        self.persist(state).await?;

        tracing::debug!(
            workflow_id = %state.workflow_id,
            step_id,
            resource_usage,
            "checkpointed step complete"
        );
        Ok(())
    }

    /// InProgress -> Failed. Also marks the run `Failed`; `current_step`
    /// stays on the failed step so resume knows where to pick up.
    pub async fn checkpoint_step_failed(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
        failure: &StepFailure,
        resource_usage: u64,
        agent_output: Option<String>,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let step = Self::step_mut(state, step_id)?;
        step.status = StepStatus::Failed;
        step.completed_at = Some(now);
        if let Some(attempt) = step.last_attempt_mut() {
            attempt.error = Some(failure.to_string());
            attempt.error_kind = Some(failure.kind());
            attempt.completed_at = Some(now);
            attempt.resource_usage = resource_usage;
            attempt.agent_output = agent_output;
        }
        state.total_resource_usage += resource_usage;
        state.status = WorkflowStatus::Failed;
        self.persist(state).await?;

        tracing::debug!(
            workflow_id = %state.workflow_id,
            step_id,
            error = %failure,
            "checkpointed step failed"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Load a run and check it still matches `def`.
    ///
    /// The persisted step-id set must equal the definition's; anything else
    /// means the definition changed since the run started.
    pub async fn restore(
        &self,
        workflow_id: &str,
        def: &WorkflowDefinition,
    ) -> Result<WorkflowState, CheckpointError> {
        let state = self.load(workflow_id).await?;
        ensure_matches(&state, def)?;
        Ok(state)
    }

    /// Whether a snapshot exists. An unreadable snapshot is an error, not
    /// an absent one.
    pub async fn exists(&self, workflow_id: &str) -> Result<bool, CheckpointError> {
        match self.load(workflow_id).await {
            Ok(_) => Ok(true),
            Err(CheckpointError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop a run's snapshot. Returns whether one existed.
    pub async fn discard(&self, workflow_id: &str) -> Result<bool, CheckpointError> {
        self.store
            .delete(workflow_id)
            .await
            .map_err(|e| CheckpointError::from_store(workflow_id, e))
    }

    /// Load a run without checking it against a definition.
    pub async fn load(&self, workflow_id: &str) -> Result<WorkflowState, CheckpointError> {
        self.store
            .load(workflow_id)
            .await
            .map_err(|e| CheckpointError::from_store(workflow_id, e))?
            .ok_or_else(|| CheckpointError::NotFound(workflow_id.to_string()))
    }

    /// All readable runs, ordered by workflow id.
    pub async fn list(&self) -> Result<Vec<WorkflowState>, CheckpointError> {
        self.store
            .list()
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))
    }
}

/// Check that a snapshot's step-id set equals the definition's.
fn ensure_matches(state: &WorkflowState, def: &WorkflowDefinition) -> Result<(), CheckpointError> {
    let persisted: BTreeSet<&str> = state.step_ids();
    let expected: BTreeSet<&str> = def.step_ids().collect();
    if persisted == expected {
        return Ok(());
    }

    let missing: Vec<&str> = expected.difference(&persisted).copied().collect();
    let unexpected: Vec<&str> = persisted.difference(&expected).copied().collect();
    Err(CheckpointError::StateCorruption {
        workflow_id: state.workflow_id.clone(),
        reason: format!(
            "step ids no longer match the workflow definition (missing: [{}], unexpected: [{}])",
            missing.join(", "),
            unexpected.join(", ")
        ),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("state store error: {0}")]
    Store(String),

    /// No run with this id.
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// The snapshot is unreadable or no longer matches the definition.
    #[error("state corruption for workflow '{workflow_id}': {reason}")]
    StateCorruption { workflow_id: String, reason: String },

    /// A transition named a step that is not part of the run.
    #[error("step '{0}' is not part of this run")]
    UnknownStep(String),
}

impl CheckpointError {
    fn from_store(workflow_id: &str, e: StoreError) -> Self {
        match e {
            StoreError::Corrupt { reason, .. } => CheckpointError::StateCorruption {
                workflow_id: workflow_id.to_string(),
                reason,
            },
            other => CheckpointError::Store(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
