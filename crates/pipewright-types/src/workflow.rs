//! Workflow definition types.
//!
//! A `WorkflowDefinition` is parsed once from YAML and never mutated. The
//! field names mirror the document format; a few keys accept the older
//! spellings (`wrapper`, `max_turns`) as aliases.

use serde::{Deserialize, Serialize};

/// Backend used when neither the step nor the configuration names one.
pub const DEFAULT_BACKEND: &str = "claude_code";

/// Default wall-clock budget for a step, in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default conversational turn limit for a step.
pub const DEFAULT_TURN_LIMIT: u32 = 10;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A named, ordered collection of steps forming a DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default)]
    pub description: String,
    /// Steps in declaration order. Declaration order breaks ties when
    /// several steps become ready at once.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Step ids in declaration order.
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single unit of work in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a workflow.
    pub id: String,
    /// Step ids that must be `Completed` before this step starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Workspace-relative paths the step must produce on success.
    #[serde(default, rename = "outputs")]
    pub declared_outputs: Vec<String>,
    /// Executor backend name (`claude_code`, `mock`, ...).
    #[serde(default, alias = "wrapper", skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Model selector passed through to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Opaque strategy reference, usually a prompt template path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_strategy: Option<String>,
    /// Wall-clock budget in seconds.
    #[serde(rename = "timeout", default = "default_timeout")]
    pub timeout_secs: u64,
    /// Maximum conversational turns.
    #[serde(alias = "max_turns", default = "default_turn_limit")]
    pub turn_limit: u32,
}

fn default_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_turn_limit() -> u32 {
    DEFAULT_TURN_LIMIT
}

impl StepDefinition {
    /// Minimal step with default execution parameters.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            declared_outputs: Vec::new(),
            backend: None,
            model: None,
            prompt_strategy: None,
            timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            turn_limit: DEFAULT_TURN_LIMIT,
        }
    }

    /// The backend this step runs on, falling back to `default`.
    pub fn backend_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.backend.as_deref().unwrap_or(default)
    }
}
