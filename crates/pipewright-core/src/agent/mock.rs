//! Deterministic in-process executor.
//!
//! Behaviour is driven by directive strings found in the step's strategy
//! reference, or in the contents of the file it names:
//!
//! - `MOCK_FAIL` -- report an execution failure
//! - `MOCK_SLOW` -- sleep for the configured delay first
//! - `MOCK_SKIP_OUTPUTS` -- report success without writing any outputs
//!
//! Without directives the mock writes placeholder content for every declared
//! output and succeeds.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipewright_types::workflow::StepDefinition;

use super::outputs::verify_outputs;
use super::{AgentExecutor, ExecutionContext, StepFailure, StepOutcome};
use crate::workspace::WorkspacePaths;

/// Backend name used in workflow definitions.
pub const MOCK_BACKEND: &str = "mock";

pub const MOCK_FAIL: &str = "MOCK_FAIL";
pub const MOCK_SLOW: &str = "MOCK_SLOW";
pub const MOCK_SKIP_OUTPUTS: &str = "MOCK_SKIP_OUTPUTS";

const USAGE_SUCCESS: u64 = 250;
const USAGE_FAILURE: u64 = 100;
const USAGE_MISSING_OUTPUTS: u64 = 50;

/// Mock backend registered as `"mock"`.
///
/// Clones share the invocation log, so a test can keep a handle after
/// registering the executor.
#[derive(Debug, Clone)]
pub struct MockAgentExecutor {
    delay: Duration,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl Default for MockAgentExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl MockAgentExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Step ids in the order they were executed.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, step_id: &str) {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(step_id.to_string());
    }

    async fn directives(step: &StepDefinition) -> String {
        let Some(strategy) = step.prompt_strategy.as_deref() else {
            return String::new();
        };
        match tokio::fs::read_to_string(strategy).await {
            Ok(contents) => format!("{strategy}\n{contents}"),
            Err(_) => strategy.to_string(),
        }
    }

    async fn write_outputs(step: &StepDefinition, workspace: &WorkspacePaths) -> std::io::Result<()> {
        for relative in &step.declared_outputs {
            let path = workspace.resolve(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, placeholder(&step.id, relative)).await?;
        }
        Ok(())
    }
}

fn placeholder(step_id: &str, relative: &str) -> String {
    if relative.ends_with(".md") {
        format!("# {step_id}\n\nMock output for step '{step_id}' ({relative}).\n")
    } else {
        format!("Mock output for step '{step_id}' ({relative})\n")
    }
}

impl AgentExecutor for MockAgentExecutor {
    fn name(&self) -> &str {
        MOCK_BACKEND
    }

    async fn execute(
        &self,
        step: &StepDefinition,
        workspace: &WorkspacePaths,
        _context: &ExecutionContext,
    ) -> StepOutcome {
        self.record(&step.id);
        let directives = Self::directives(step).await;

        if directives.contains(MOCK_SLOW) {
            tracing::debug!(step_id = %step.id, delay_ms = self.delay.as_millis() as u64, "mock delay");
            tokio::time::sleep(self.delay).await;
        }

        if directives.contains(MOCK_FAIL) {
            return StepOutcome::failure(
                StepFailure::Execution(format!(
                    "mock failure requested by {MOCK_FAIL} for step '{}'",
                    step.id
                )),
                USAGE_FAILURE,
            )
            .with_agent_output(&format!("mock: step '{}' aborted", step.id));
        }

        if !directives.contains(MOCK_SKIP_OUTPUTS) {
            if let Err(e) = Self::write_outputs(step, workspace).await {
                return StepOutcome::failure(
                    StepFailure::Execution(format!("failed to write mock outputs: {e}")),
                    USAGE_FAILURE,
                );
            }
        }

        match verify_outputs(step, workspace).await {
            Ok(produced) => {
                let transcript = format!("mock: step '{}' wrote {} output(s)", step.id, produced.len());
                StepOutcome::success(produced, USAGE_SUCCESS).with_agent_output(&transcript)
            }
            Err(failure) => StepOutcome::failure(failure, USAGE_MISSING_OUTPUTS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::state::StepErrorKind;

    fn step_with(strategy: Option<&str>, outputs: &[&str]) -> StepDefinition {
        let mut s = StepDefinition::new("build");
        s.prompt_strategy = strategy.map(String::from);
        s.declared_outputs = outputs.iter().map(|o| o.to_string()).collect();
        s
    }

    #[tokio::test]
    async fn test_success_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspacePaths::at("00001", dir.path());
        let mock = MockAgentExecutor::new(Duration::ZERO);

        let outcome = mock
            .execute(
                &step_with(None, &["project/plan.md", "project/notes.txt"]),
                &ws,
                &ExecutionContext::default(),
            )
            .await;

        assert!(outcome.error.is_none(), "got: {outcome:?}");
        assert_eq!(outcome.resource_usage, 250);
        assert_eq!(
            outcome.agent_output.as_deref(),
            Some("mock: step 'build' wrote 2 output(s)")
        );
        assert_eq!(outcome.produced_outputs.len(), 2);
        let plan = std::fs::read_to_string(dir.path().join("project/plan.md")).unwrap();
        assert!(plan.starts_with("# build"), "got: {plan}");
        assert_eq!(mock.invocations(), vec!["build"]);
    }

    #[tokio::test]
    async fn test_fail_directive_in_strategy_string() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspacePaths::at("00001", dir.path());
        let mock = MockAgentExecutor::new(Duration::ZERO);

        let outcome = mock
            .execute(&step_with(Some("MOCK_FAIL"), &["x.txt"]), &ws, &ExecutionContext::default())
            .await;

        let err = outcome.error.expect("should fail");
        assert_eq!(err.kind(), StepErrorKind::Execution);
        assert!(err.to_string().contains("MOCK_FAIL"), "got: {err}");
        assert_eq!(outcome.resource_usage, 100);
        assert!(!dir.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_fail_directive_in_prompt_file() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = dir.path().join("prompt.md");
        std::fs::write(&prompt, "Do the work.\nMOCK_FAIL\n").unwrap();
        let ws = WorkspacePaths::at("00001", dir.path());
        let mock = MockAgentExecutor::new(Duration::ZERO);

        let step = step_with(Some(prompt.to_str().unwrap()), &[]);
        let outcome = mock.execute(&step, &ws, &ExecutionContext::default()).await;
        assert!(outcome.error.is_some());
        assert_eq!(outcome.agent_output.as_deref(), Some("mock: step 'build' aborted"));
    }

    #[tokio::test]
    async fn test_skip_outputs_yields_output_missing() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspacePaths::at("00001", dir.path());
        let mock = MockAgentExecutor::new(Duration::ZERO);

        let outcome = mock
            .execute(
                &step_with(Some("MOCK_SKIP_OUTPUTS"), &["x.txt"]),
                &ws,
                &ExecutionContext::default(),
            )
            .await;

        assert_eq!(
            outcome.error,
            Some(StepFailure::OutputMissing {
                paths: vec!["x.txt".to_string()]
            })
        );
        assert_eq!(outcome.resource_usage, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_directive_sleeps() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspacePaths::at("00001", dir.path());
        let mock = MockAgentExecutor::new(Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        let outcome = mock
            .execute(&step_with(Some("MOCK_SLOW"), &[]), &ws, &ExecutionContext::default())
            .await;
        assert!(outcome.error.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspacePaths::at("00001", dir.path());
        let mock = MockAgentExecutor::new(Duration::ZERO);
        let step = step_with(None, &["out.md"]);

        let first = mock.execute(&step, &ws, &ExecutionContext::default()).await;
        let second = mock.execute(&step, &ws, &ExecutionContext::default()).await;
        assert_eq!(first, second);
        assert_eq!(mock.invocations(), vec!["build", "build"]);
    }
}
