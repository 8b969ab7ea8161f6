//! Agent executor abstraction.
//!
//! An `AgentExecutor` performs one step's work inside a workspace and reports
//! a `StepOutcome`. The orchestrator depends only on this trait; concrete
//! backends are selected at runtime by name through `AgentRegistry`.
//!
//! - `mock` -- deterministic in-process backend driven by directive strings
//! - `outputs` -- declared-output verification and fingerprinting
//! - `box_executor` -- object-safe wrapper for runtime selection

pub mod box_executor;
pub mod mock;
pub mod outputs;

use std::collections::{BTreeMap, HashMap};

use pipewright_types::state::StepErrorKind;
use pipewright_types::workflow::StepDefinition;
use thiserror::Error;

use crate::workspace::WorkspacePaths;

pub use box_executor::BoxAgentExecutor;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    /// The executor exceeded its wall-clock budget.
    #[error("Execution timed out after {secs} seconds")]
    Timeout { secs: u64 },

    /// The executor reported success but declared outputs are absent or empty.
    #[error("missing declared outputs: {}", paths.join(", "))]
    OutputMissing { paths: Vec<String> },

    /// The executor reported failure.
    #[error("{0}")]
    Execution(String),
}

impl StepFailure {
    pub fn kind(&self) -> StepErrorKind {
        match self {
            StepFailure::Timeout { .. } => StepErrorKind::Timeout,
            StepFailure::OutputMissing { .. } => StepErrorKind::OutputMissing,
            StepFailure::Execution(_) => StepErrorKind::Execution,
        }
    }
}

/// Longest agent transcript kept on an attempt record, in chars.
pub const AGENT_OUTPUT_LIMIT: usize = 2000;

/// Keep the last [`AGENT_OUTPUT_LIMIT`] chars of `text`, noting how much was
/// cut from the front.
pub fn clip_agent_output(text: &str) -> String {
    let text = text.trim_end();
    let total = text.chars().count();
    if total <= AGENT_OUTPUT_LIMIT {
        return text.to_string();
    }
    let omitted = total - AGENT_OUTPUT_LIMIT;
    let tail: String = text.chars().skip(omitted).collect();
    format!("[{omitted} chars omitted]\n{tail}")
}

/// Result fragment reported by an executor for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Artifact path -> content fingerprint.
    pub produced_outputs: BTreeMap<String, String>,
    pub resource_usage: u64,
    pub error: Option<StepFailure>,
    /// What the agent printed, already clipped.
    pub agent_output: Option<String>,
}

impl StepOutcome {
    pub fn success(produced_outputs: BTreeMap<String, String>, resource_usage: u64) -> Self {
        Self {
            produced_outputs,
            resource_usage,
            error: None,
            agent_output: None,
        }
    }

    pub fn failure(error: StepFailure, resource_usage: u64) -> Self {
        Self {
            produced_outputs: BTreeMap::new(),
            resource_usage,
            error: Some(error),
            agent_output: None,
        }
    }

    /// Attach the agent's output. Blank output is dropped.
    pub fn with_agent_output(mut self, text: &str) -> Self {
        let clipped = clip_agent_output(text);
        self.agent_output = (!clipped.is_empty()).then_some(clipped);
        self
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Variables available to an executor for template substitution.
///
/// Always carries `workspace` (the workspace root) once built with
/// [`ExecutionContext::for_workspace`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    vars: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// `vars` plus `workspace` pointing at the workspace root.
    pub fn for_workspace(workspace: &WorkspacePaths, vars: &BTreeMap<String, String>) -> Self {
        let mut vars = vars.clone();
        vars.insert(
            "workspace".to_string(),
            workspace.root.display().to_string(),
        );
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Replace `{key}` placeholders with their values. Unknown placeholders
    /// and other braces are left as-is.
    pub fn render(&self, template: &str) -> String {
        self.vars.iter().fold(template.to_string(), |acc, (k, v)| {
            acc.replace(&format!("{{{k}}}"), v)
        })
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A backend that performs one step's work.
///
/// Implementations must tolerate being invoked again for the same step after
/// a failed or interrupted attempt. Failures are reported in the returned
/// `StepOutcome`, never by panicking.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait AgentExecutor: Send + Sync {
    /// Backend name used in workflow definitions (e.g. `"mock"`).
    fn name(&self) -> &str;

    fn execute(
        &self,
        step: &StepDefinition,
        workspace: &WorkspacePaths,
        context: &ExecutionContext,
    ) -> impl std::future::Future<Output = StepOutcome> + Send;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Executors keyed by backend name.
#[derive(Default)]
pub struct AgentRegistry {
    executors: HashMap<String, BoxAgentExecutor>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` under its own name, replacing any previous entry.
    pub fn register<T: AgentExecutor + 'static>(&mut self, executor: T) -> &mut Self {
        let boxed = BoxAgentExecutor::new(executor);
        self.executors.insert(boxed.name().to_string(), boxed);
        self
    }

    pub fn get(&self, name: &str) -> Option<&BoxAgentExecutor> {
        self.executors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("executors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::MockAgentExecutor;

    #[test]
    fn test_failure_kinds_and_messages() {
        let t = StepFailure::Timeout { secs: 30 };
        assert_eq!(t.kind(), StepErrorKind::Timeout);
        assert_eq!(t.to_string(), "Execution timed out after 30 seconds");

        let m = StepFailure::OutputMissing {
            paths: vec!["a.md".to_string(), "b.md".to_string()],
        };
        assert_eq!(m.kind(), StepErrorKind::OutputMissing);
        assert!(m.to_string().contains("a.md, b.md"), "got: {m}");

        assert_eq!(StepFailure::Execution("x".into()).kind(), StepErrorKind::Execution);
    }

    #[test]
    fn test_render_substitutes_known_keys_only() {
        let mut vars = BTreeMap::new();
        vars.insert("problem_name".to_string(), "todo-app".to_string());
        let ws = WorkspacePaths::at("00001", "/tmp/ws/00001");
        let ctx = ExecutionContext::for_workspace(&ws, &vars);

        let out = ctx.render("Build {problem_name} in {workspace}. Keep {\"json\": true} and {unknown}.");
        assert_eq!(
            out,
            "Build todo-app in /tmp/ws/00001. Keep {\"json\": true} and {unknown}."
        );
        assert_eq!(ctx.get("workspace"), Some("/tmp/ws/00001"));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = AgentRegistry::new();
        registry.register(MockAgentExecutor::default());

        assert!(registry.contains("mock"));
        assert!(registry.get("other").is_none());
        assert_eq!(registry.names(), vec!["mock"]);
        assert_eq!(registry.get("mock").unwrap().name(), "mock");

        // Registering under the same name replaces the entry.
        registry.register(MockAgentExecutor::new(std::time::Duration::ZERO));
        assert_eq!(registry.names(), vec!["mock"]);
    }

    #[test]
    fn test_agent_output_keeps_tail() {
        let short = StepOutcome::default().with_agent_output("done\n\n");
        assert_eq!(short.agent_output.as_deref(), Some("done"));

        let blank = StepOutcome::default().with_agent_output("  \n");
        assert!(blank.agent_output.is_none());

        let long = format!("{}END", "x".repeat(AGENT_OUTPUT_LIMIT + 10));
        let clipped = clip_agent_output(&long);
        assert!(clipped.starts_with("[13 chars omitted]\n"), "got: {}", &clipped[..30]);
        assert!(clipped.ends_with("END"));
        assert_eq!(clipped.lines().nth(1).unwrap().chars().count(), AGENT_OUTPUT_LIMIT);
    }
}
