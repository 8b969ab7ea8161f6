//! Sequential, resumable workflow orchestrator.
//!
//! Resolves the step order once, then drives steps one at a time through
//! their backend executor, persisting every transition via the
//! `CheckpointManager`. The first failed step halts the run (fail-fast);
//! `resume` is the retry path and continues from the first step that is not
//! `Completed`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use pipewright_types::state::{StepStatus, WorkflowState, WorkflowStatus, WorkflowSummary};
use pipewright_types::workflow::{DEFAULT_BACKEND, StepDefinition, WorkflowDefinition};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::dag::resolve_execution_order;
use super::definition::WorkflowError;
use crate::agent::{AgentRegistry, ExecutionContext, StepFailure, StepOutcome};
use crate::repository::state::StateStore;
use crate::workspace::{WorkspaceError, WorkspaceManager, WorkspacePaths};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Coarse outcome class, used by callers to branch without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Dependency,
    Execution,
    NotFound,
    Corruption,
    Interrupted,
}

/// Errors that abort an orchestrator operation.
///
/// Per-step failures are not errors: they are recorded in the returned
/// `WorkflowState` with overall status `Failed`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The definition is malformed or cyclic.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// A step names a backend that is not registered.
    #[error("step '{step_id}' uses unknown backend '{backend}' (registered: {registered})")]
    UnknownBackend {
        step_id: String,
        backend: String,
        registered: String,
    },

    /// A step was reached before one of its dependencies completed.
    #[error("dependency '{dependency}' of step '{step_id}' is not completed")]
    DependencyUnsatisfied { step_id: String, dependency: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// A run already has state under this id.
    #[error("workflow '{0}' already has recorded state; resume it instead")]
    AlreadyStarted(String),

    /// Refused to delete a run that may still be executing.
    #[error("workflow '{0}' is still in progress and may be running elsewhere")]
    RunInProgress(String),

    /// Cancellation was requested while the run was active.
    #[error("workflow '{workflow_id}' interrupted{}", step_id.as_ref().map(|s| format!(" during step '{s}'")).unwrap_or_default())]
    Interrupted {
        workflow_id: String,
        step_id: Option<String>,
    },
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::Workflow(WorkflowError::CycleDetected { .. }) => {
                ErrorClass::Dependency
            }
            OrchestratorError::Workflow(_)
            | OrchestratorError::UnknownBackend { .. }
            | OrchestratorError::AlreadyStarted(_)
            | OrchestratorError::RunInProgress(_) => ErrorClass::Validation,
            OrchestratorError::DependencyUnsatisfied { .. } => ErrorClass::Dependency,
            OrchestratorError::Checkpoint(CheckpointError::NotFound(_))
            | OrchestratorError::Workspace(WorkspaceError::NotFound(_))
            | OrchestratorError::Workspace(WorkspaceError::InvalidId(_)) => ErrorClass::NotFound,
            OrchestratorError::Checkpoint(CheckpointError::StateCorruption { .. }) => {
                ErrorClass::Corruption
            }
            OrchestratorError::Checkpoint(_) | OrchestratorError::Workspace(_) => {
                ErrorClass::Execution
            }
            OrchestratorError::Interrupted { .. } => ErrorClass::Interrupted,
        }
    }
}

// ---------------------------------------------------------------------------
// Run request
// ---------------------------------------------------------------------------

/// Caller-supplied inputs for a new run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Extra context variables for executors.
    pub context: BTreeMap<String, String>,
    /// Copied into the workspace's `context/` dir when set.
    pub problem_file: Option<PathBuf>,
    /// Recorded in the snapshot so `resume` can reload the definition.
    pub definition_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives workflow runs.
///
/// Owns the in-memory `WorkflowState` for the duration of a run; the store
/// behind the `CheckpointManager` is the only writer to durable storage.
pub struct Orchestrator<S: StateStore> {
    checkpoint: CheckpointManager<S>,
    agents: AgentRegistry,
    workspaces: WorkspaceManager,
    default_backend: String,
    backend_override: Option<String>,
    cancel: CancellationToken,
}

impl<S: StateStore> Orchestrator<S> {
    pub fn new(store: S, agents: AgentRegistry, workspaces: WorkspaceManager) -> Self {
        Self {
            checkpoint: CheckpointManager::new(store),
            agents,
            workspaces,
            default_backend: DEFAULT_BACKEND.to_string(),
            backend_override: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Backend for steps that do not name one.
    pub fn with_default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = backend.into();
        self
    }

    /// Force every step onto one backend.
    pub fn with_backend_override(mut self, backend: Option<String>) -> Self {
        self.backend_override = backend;
        self
    }

    /// Token that interrupts the active run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Backend a step will run on.
    pub fn backend_for<'a>(&'a self, step: &'a StepDefinition) -> &'a str {
        self.backend_override
            .as_deref()
            .unwrap_or_else(|| step.backend_or(&self.default_backend))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Validate `def` against the resolver and the registered backends.
    ///
    /// Returns the execution order. Touches neither workspaces nor state.
    pub fn validate(&self, def: &WorkflowDefinition) -> Result<Vec<String>, OrchestratorError> {
        let order = resolve_execution_order(def)?;
        for step in &def.steps {
            let backend = self.backend_for(step);
            if !self.agents.contains(backend) {
                return Err(OrchestratorError::UnknownBackend {
                    step_id: step.id.clone(),
                    backend: backend.to_string(),
                    registered: self.agents.names().join(", "),
                });
            }
        }
        Ok(order)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Validate, allocate a fresh workspace, and run every step.
    pub async fn run(
        &self,
        def: &WorkflowDefinition,
        request: RunRequest,
    ) -> Result<WorkflowState, OrchestratorError> {
        let order = self.validate(def)?;
        let workspace = self.workspaces.create()?;
        self.start(def, &order, &workspace, request).await
    }

    async fn start(
        &self,
        def: &WorkflowDefinition,
        order: &[String],
        workspace: &WorkspacePaths,
        request: RunRequest,
    ) -> Result<WorkflowState, OrchestratorError> {
        // Never overwrite an existing snapshot, readable or not.
        if self.checkpoint.exists(&workspace.id).await? {
            return Err(OrchestratorError::AlreadyStarted(workspace.id.clone()));
        }

        let mut context = request.context;
        if let Some(problem) = &request.problem_file {
            let copied = self.workspaces.copy_into_context(workspace, problem, None)?;
            if let Some(stem) = problem.file_stem().and_then(|s| s.to_str()) {
                context
                    .entry("problem_name".to_string())
                    .or_insert_with(|| stem.to_string());
            }
            context.insert("problem_file".to_string(), copied.display().to_string());
        }
        context
            .entry("problem_name".to_string())
            .or_insert_with(|| def.name.clone());

        let mut state = WorkflowState::new(&workspace.id, def);
        state.workspace_path = Some(workspace.root.clone());
        state.definition_path = request.definition_path;
        state.context = context;
        self.checkpoint.checkpoint_run_start(&mut state).await?;

        tracing::info!(
            workflow_id = %state.workflow_id,
            workflow = %def.name,
            steps = order.len(),
            "starting workflow run"
        );
        self.drive(def, order, workspace, state).await
    }

    /// Continue a run from the first step that is not `Completed`.
    ///
    /// A run that is already `Completed` is returned unchanged without
    /// writing or executing anything. Otherwise the snapshot file is copied
    /// to a timestamped backup before the first new transition is written.
    pub async fn resume(
        &self,
        workflow_id: &str,
        def: &WorkflowDefinition,
    ) -> Result<WorkflowState, OrchestratorError> {
        let state = self.checkpoint.restore(workflow_id, def).await?;
        let order = self.validate(def)?;

        if state.status == WorkflowStatus::Completed {
            tracing::info!(workflow_id, "workflow already completed; nothing to resume");
            return Ok(state);
        }

        let workspace = match &state.workspace_path {
            Some(root) if root.is_dir() => WorkspacePaths::at(workflow_id, root.clone()),
            _ => self.workspaces.open(workflow_id)?,
        };
        if let Some(backup) = self.workspaces.backup_state(&workspace)? {
            tracing::info!(workflow_id, backup = %backup.display(), "saved snapshot backup before resuming");
        }

        tracing::info!(
            workflow_id,
            completed = state.completed_steps().len(),
            remaining = order.len() - state.completed_steps().len(),
            "resuming workflow run"
        );
        self.drive(def, &order, &workspace, state).await
    }

    /// Current durable state of a run.
    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowState, OrchestratorError> {
        Ok(self.checkpoint.load(workflow_id).await?)
    }

    /// Remove a run's snapshot and its workspace. Returns the removed root.
    ///
    /// A run still marked `InProgress` may belong to a live process and is
    /// only removed with `force`. An unreadable snapshot never blocks removal.
    pub async fn delete(&self, workflow_id: &str, force: bool) -> Result<PathBuf, OrchestratorError> {
        let workspace = self.workspaces.find(workflow_id)?;
        match self.checkpoint.load(workflow_id).await {
            Ok(state) if state.status == WorkflowStatus::InProgress && !force => {
                return Err(OrchestratorError::RunInProgress(workflow_id.to_string()));
            }
            Ok(_)
            | Err(CheckpointError::NotFound(_))
            | Err(CheckpointError::StateCorruption { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        self.checkpoint.discard(workflow_id).await?;
        let root = self.workspaces.delete(&workspace.id)?;
        tracing::info!(workflow_id, root = %root.display(), "deleted workflow run");
        Ok(root)
    }

    /// Summaries of every readable run, ordered by workflow id.
    pub async fn list(&self) -> Result<Vec<WorkflowSummary>, OrchestratorError> {
        Ok(self
            .checkpoint
            .list()
            .await?
            .iter()
            .map(WorkflowSummary::from)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Step loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        def: &WorkflowDefinition,
        order: &[String],
        workspace: &WorkspacePaths,
        mut state: WorkflowState,
    ) -> Result<WorkflowState, OrchestratorError> {
        let context = ExecutionContext::for_workspace(workspace, &state.context);

        for step_id in order {
            if state.step_status(step_id) == Some(StepStatus::Completed) {
                tracing::debug!(workflow_id = %state.workflow_id, step_id = %step_id, "skipping completed step");
                continue;
            }
            let Some(step) = def.step(step_id) else {
                return Err(CheckpointError::UnknownStep(step_id.clone()).into());
            };

            if let Some(dep) = step
                .depends_on
                .iter()
                .find(|d| state.step_status(d) != Some(StepStatus::Completed))
            {
                return Err(OrchestratorError::DependencyUnsatisfied {
                    step_id: step_id.clone(),
                    dependency: dep.clone(),
                });
            }

            let backend = self.backend_for(step);
            let executor = self
                .agents
                .get(backend)
                .ok_or_else(|| OrchestratorError::UnknownBackend {
                    step_id: step_id.clone(),
                    backend: backend.to_string(),
                    registered: self.agents.names().join(", "),
                })?;

            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Interrupted {
                    workflow_id: state.workflow_id.clone(),
                    step_id: None,
                });
            }

            let attempt = self.checkpoint.checkpoint_step_start(&mut state, step_id).await?;
            tracing::info!(
                workflow_id = %state.workflow_id,
                step_id = %step_id,
                backend,
                attempt,
                "executing step"
            );

            let budget = Duration::from_secs(step.timeout_secs);
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::warn!(workflow_id = %state.workflow_id, step_id = %step_id, "interrupted during step");
                    return Err(OrchestratorError::Interrupted {
                        workflow_id: state.workflow_id.clone(),
                        step_id: Some(step_id.clone()),
                    });
                }
                result = tokio::time::timeout(budget, executor.execute(step, workspace, &context)) => {
                    result.unwrap_or_else(|_| {
                        StepOutcome::failure(StepFailure::Timeout { secs: step.timeout_secs }, 0)
                    })
                }
            };

            match outcome.error {
                None => {
                    self.checkpoint
                        .checkpoint_step_complete(
                            &mut state,
                            step_id,
                            outcome.produced_outputs,
                            outcome.resource_usage,
                            outcome.agent_output,
                        )
                        .await?;
                }
                Some(failure) => {
                    tracing::error!(
                        workflow_id = %state.workflow_id,
                        step_id = %step_id,
                        kind = %failure.kind(),
                        error = %failure,
                        "step failed; halting workflow"
                    );
                    self.checkpoint
                        .checkpoint_step_failed(
                            &mut state,
                            step_id,
                            &failure,
                            outcome.resource_usage,
                            outcome.agent_output,
                        )
                        .await?;
                    return Ok(state);
                }
            }
        }

        self.checkpoint.checkpoint_run_complete(&mut state).await?;
        tracing::info!(
            workflow_id = %state.workflow_id,
            resource_usage = state.total_resource_usage,
            "workflow completed"
        );
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
