//! Persisted run state.
//!
//! `WorkflowState` is the durable snapshot written after every step
//! transition. Its JSON form is the on-disk format, so field names here are
//! part of the contract.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowDefinition;

/// Version of the snapshot layout. Any other value is refused on load.
pub const STATE_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// No step has started.
    #[default]
    Pending,
    /// At least one step has started.
    InProgress,
    /// Every step is completed.
    Completed,
    /// A step failed and the run halted.
    Failed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::InProgress => write!(f, "in_progress"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Timeout,
    OutputMissing,
    Execution,
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepErrorKind::Timeout => write!(f, "timeout"),
            StepErrorKind::OutputMissing => write!(f, "output_missing"),
            StepErrorKind::Execution => write!(f, "execution"),
        }
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// One invocation of a step's executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt_number: u32,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,
    /// When the attempt started.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_usage: u64,
    /// Tail of what the agent printed, clipped before it is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_output: Option<String>,
}

/// Per-step slice of the run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Artifact path -> content fingerprint.
    #[serde(default)]
    pub produced_outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: Vec::new(),
            produced_outputs: BTreeMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    pub fn last_attempt_mut(&mut self) -> Option<&mut AttemptRecord> {
        self.attempts.last_mut()
    }
}

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// Durable snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub schema_version: u32,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Step awaiting execution or mid-execution.
    pub current_step: Option<String>,
    pub total_resource_usage: u64,
    pub steps: BTreeMap<String, StepResult>,

    /// Root of the isolated workspace this run writes into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    /// Where the workflow YAML was loaded from, so resume can reload it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_path: Option<PathBuf>,
    /// Context variables handed to every executor invocation.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl WorkflowState {
    /// Fresh state with every step `Pending`.
    pub fn new(workflow_id: impl Into<String>, def: &WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            workflow_id: workflow_id.into(),
            workflow_name: def.name.clone(),
            status: WorkflowStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            current_step: None,
            total_resource_usage: 0,
            steps: def
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepResult::pending(&s.id)))
                .collect(),
            workspace_path: None,
            definition_path: None,
            context: BTreeMap::new(),
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|s| s.status)
    }

    pub fn step_ids(&self) -> BTreeSet<&str> {
        self.steps.keys().map(String::as_str).collect()
    }

    fn steps_with(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .values()
            .filter(|s| s.status == status)
            .map(|s| s.step_id.as_str())
            .collect()
    }

    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps_with(StepStatus::Completed)
    }

    pub fn pending_steps(&self) -> Vec<&str> {
        self.steps_with(StepStatus::Pending)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps_with(StepStatus::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.steps.values().any(|s| s.status == StepStatus::Failed)
    }

    /// Wall-clock time from creation to completion, if the run completed.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.created_at)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Row returned by `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowState> for WorkflowSummary {
    fn from(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            workflow_name: state.workflow_name.clone(),
            status: state.status,
            updated_at: state.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepDefinition;

    fn def() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "pipeline".to_string(),
            description: String::new(),
            steps: vec![StepDefinition::new("a"), StepDefinition::new("b")],
        }
    }

    #[test]
    fn test_new_state_is_all_pending() {
        let state = WorkflowState::new("00001", &def());
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
        assert_eq!(state.status, WorkflowStatus::Pending);
        assert_eq!(state.pending_steps(), vec!["a", "b"]);
        assert!(state.completed_steps().is_empty());
        assert!(!state.has_failures());
        assert!(state.duration().is_none());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&StepStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: WorkflowStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, WorkflowStatus::Failed);
        assert_eq!(StepErrorKind::OutputMissing.to_string(), "output_missing");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut state = WorkflowState::new("00007", &def());
        let step = state.steps.get_mut("a").unwrap();
        step.status = StepStatus::Failed;
        step.attempts.push(AttemptRecord {
            attempt_number: 1,
            error: Some("boom".to_string()),
            error_kind: Some(StepErrorKind::Execution),
            timestamp: Utc::now(),
            completed_at: None,
            resource_usage: 100,
            agent_output: None,
        });

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["workflow_id"], "00007");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["steps"]["a"]["status"], "failed");
        assert_eq!(value["steps"]["a"]["attempts"][0]["error"], "boom");
        assert_eq!(value["steps"]["a"]["attempts"][0]["error_kind"], "execution");
        assert_eq!(value["steps"]["b"]["attempts"].as_array().unwrap().len(), 0);
        assert!(value["steps"]["b"]["produced_outputs"].is_object());
        assert!(value["current_step"].is_null());
        assert!(value["steps"]["a"]["attempts"][0].get("agent_output").is_none());

        let parsed: WorkflowState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, state);
        assert_eq!(parsed.failed_steps(), vec!["a"]);
    }

    #[test]
    fn test_snapshot_without_schema_version_is_rejected() {
        let json = r#"{"workflow_id":"1","workflow_name":"x","status":"pending",
            "created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z",
            "current_step":null,"total_resource_usage":0,"steps":{}}"#;
        let err = serde_json::from_str::<WorkflowState>(json).unwrap_err();
        assert!(err.to_string().contains("schema_version"), "got: {err}");
    }

    #[test]
    fn test_summary_from_state() {
        let state = WorkflowState::new("00003", &def());
        let summary = WorkflowSummary::from(&state);
        assert_eq!(summary.workflow_id, "00003");
        assert_eq!(summary.workflow_name, "pipeline");
        assert_eq!(summary.status, WorkflowStatus::Pending);
    }
}
