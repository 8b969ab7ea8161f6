//! Production backend that drives the `claude` CLI as a subprocess.
//!
//! One invocation per step attempt: the rendered prompt goes in via `-p`,
//! the process runs inside the workspace root, and the JSON result on stdout
//! is read for usage and error status. Declared outputs are verified after
//! the process exits.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use pipewright_core::agent::outputs::verify_outputs;
use pipewright_core::agent::{AgentExecutor, ExecutionContext, StepFailure, StepOutcome};
use pipewright_core::workspace::WorkspacePaths;
use pipewright_types::config::ClaudeConfig;
use pipewright_types::workflow::StepDefinition;
use serde::Deserialize;

/// Backend name used in workflow definitions.
pub const CLAUDE_CODE_BACKEND: &str = "claude_code";

/// Maximum characters of stderr carried into a failure message.
const STDERR_LIMIT: usize = 500;

const SUBTYPE_MAX_TURNS: &str = "error_max_turns";

/// Executor that shells out to the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeExecutor {
    config: ClaudeConfig,
}

impl ClaudeCodeExecutor {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }

    /// Read the step's prompt template and substitute context variables.
    async fn load_prompt(
        step: &StepDefinition,
        context: &ExecutionContext,
    ) -> Result<String, StepFailure> {
        let Some(strategy) = step.prompt_strategy.as_deref() else {
            return Err(StepFailure::Execution(format!(
                "step '{}' has no prompt_strategy",
                step.id
            )));
        };
        let template = tokio::fs::read_to_string(strategy).await.map_err(|e| {
            StepFailure::Execution(format!("failed to read prompt template '{strategy}': {e}"))
        })?;
        Ok(context.render(&template))
    }

    fn build_args(&self, step: &StepDefinition, root: &Path, prompt: String) -> Vec<String> {
        let model = step
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        let mut args = vec![
            "-p".to_string(),
            prompt,
            "--model".to_string(),
            model,
            "--max-turns".to_string(),
            step.turn_limit.to_string(),
            "--add-dir".to_string(),
            root.display().to_string(),
            "--no-session-persistence".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        for tool in &self.config.allowed_tools {
            args.push("--allowedTools".to_string());
            args.push(tool.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

/// The subset of the CLI's JSON result we care about.
#[derive(Debug, Default, Deserialize)]
struct CliResult {
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    usage: CliUsage,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl CliResult {
    fn parse(stdout: &[u8]) -> Self {
        serde_json::from_slice(stdout).unwrap_or_default()
    }

    fn resource_usage(&self) -> u64 {
        self.usage.input_tokens + self.usage.output_tokens
    }

    /// The agent's final message, or raw stdout when it was not JSON.
    fn transcript(&self, stdout: &[u8]) -> String {
        match &self.result {
            Some(text) => text.clone(),
            None => String::from_utf8_lossy(stdout).into_owned(),
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl AgentExecutor for ClaudeCodeExecutor {
    fn name(&self) -> &str {
        CLAUDE_CODE_BACKEND
    }

    async fn execute(
        &self,
        step: &StepDefinition,
        workspace: &WorkspacePaths,
        context: &ExecutionContext,
    ) -> StepOutcome {
        let prompt = match Self::load_prompt(step, context).await {
            Ok(prompt) => prompt,
            Err(failure) => return StepOutcome::failure(failure, 0),
        };
        let args = self.build_args(step, &workspace.root, prompt);

        tracing::info!(
            step_id = %step.id,
            workspace_id = %workspace.id,
            binary = %self.config.binary,
            max_turns = step.turn_limit,
            "starting claude step"
        );

        let child = tokio::process::Command::new(&self.config.binary)
            .args(&args)
            .current_dir(&workspace.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return StepOutcome::failure(
                    StepFailure::Execution(format!(
                        "failed to spawn '{}': {e}",
                        self.config.binary
                    )),
                    0,
                );
            }
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        let timeout = Duration::from_secs(step.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return StepOutcome::failure(
                    StepFailure::Execution(format!("failed to wait for claude process: {e}")),
                    0,
                );
            }
            Err(_) => {
                tracing::error!(step_id = %step.id, timeout_secs = step.timeout_secs, "claude step timed out");
                return StepOutcome::failure(
                    StepFailure::Timeout {
                        secs: step.timeout_secs,
                    },
                    0,
                );
            }
        };

        let result = CliResult::parse(&output.stdout);
        let usage = result.resource_usage();
        let transcript = result.transcript(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = truncate_chars(stderr.trim(), STDERR_LIMIT);
            tracing::error!(
                step_id = %step.id,
                exit_status = %output.status,
                stderr = %stderr,
                "claude process failed"
            );
            return StepOutcome::failure(
                StepFailure::Execution(format!("claude exited with {}: {stderr}", output.status)),
                usage,
            )
            .with_agent_output(&transcript);
        }

        if result.is_error {
            let message = match result.subtype.as_deref() {
                Some(SUBTYPE_MAX_TURNS) => {
                    format!("turn limit of {} reached", step.turn_limit)
                }
                other => result
                    .result
                    .clone()
                    .or_else(|| other.map(String::from))
                    .unwrap_or_else(|| "claude reported an error".to_string()),
            };
            return StepOutcome::failure(StepFailure::Execution(message), usage)
                .with_agent_output(&transcript);
        }

        let outcome = match verify_outputs(step, workspace).await {
            Ok(produced) => {
                tracing::info!(step_id = %step.id, usage, outputs = produced.len(), "claude step completed");
                StepOutcome::success(produced, usage)
            }
            Err(failure) => {
                tracing::warn!(step_id = %step.id, error = %failure, "claude step missing outputs");
                StepOutcome::failure(failure, usage)
            }
        };
        outcome.with_agent_output(&transcript)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    use pipewright_core::agent::AGENT_OUTPUT_LIMIT;
    use pipewright_core::workspace::WorkspaceManager;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        workspace: WorkspacePaths,
        executor: ClaudeCodeExecutor,
        prompt: String,
    }

    /// Install `body` as a fake `claude` binary and create a workspace.
    fn fixture(body: &str) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("fake-claude");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let prompt = tmp.path().join("prompt.md");
        std::fs::write(&prompt, "Solve {problem_name} in {workspace}").unwrap();

        let workspace = WorkspaceManager::new(tmp.path().join("ws"))
            .unwrap()
            .create()
            .unwrap();

        let config = ClaudeConfig {
            binary: script.display().to_string(),
            ..ClaudeConfig::default()
        };
        Fixture {
            _tmp: tmp,
            workspace,
            executor: ClaudeCodeExecutor::new(config),
            prompt: prompt.display().to_string(),
        }
    }

    fn step(fx: &Fixture, outputs: &[&str]) -> StepDefinition {
        let mut step = StepDefinition::new("design");
        step.prompt_strategy = Some(fx.prompt.clone());
        step.declared_outputs = outputs.iter().map(|s| s.to_string()).collect();
        step
    }

    fn context(fx: &Fixture) -> ExecutionContext {
        let vars = BTreeMap::from([("problem_name".to_string(), "sorting".to_string())]);
        ExecutionContext::for_workspace(&fx.workspace, &vars)
    }

    const SUCCESS_JSON: &str =
        r#"{"type":"result","subtype":"success","is_error":false,"usage":{"input_tokens":120,"output_tokens":30}}"#;

    #[tokio::test]
    async fn test_success_records_usage_and_fingerprints() {
        let fx = fixture(&format!(
            "printf '%s\\n' \"$@\" > args.txt\nprintf 'design' > project/design.md\necho '{SUCCESS_JSON}'"
        ));
        let mut step = step(&fx, &["project/design.md"]);
        step.model = Some("opus".into());
        step.turn_limit = 7;

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        assert!(outcome.error.is_none(), "got: {:?}", outcome.error);
        assert_eq!(outcome.resource_usage, 150);
        assert_eq!(outcome.produced_outputs.len(), 1);
        assert!(outcome.produced_outputs.contains_key("project/design.md"));

        let args = std::fs::read_to_string(fx.workspace.root.join("args.txt")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        let expected_prompt = format!("Solve sorting in {}", fx.workspace.root.display());
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], expected_prompt);
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]), "got: {args:?}");
        assert!(args.windows(2).any(|w| w == ["--max-turns", "7"]), "got: {args:?}");
        assert!(args.windows(2).any(|w| w == ["--output-format", "json"]), "got: {args:?}");
        assert!(args.contains(&"--no-session-persistence"));
        assert_eq!(args.iter().filter(|a| **a == "--allowedTools").count(), 6);
    }

    #[tokio::test]
    async fn test_default_model_when_step_has_none() {
        let fx = fixture(&format!("printf '%s\\n' \"$@\" > args.txt\necho '{SUCCESS_JSON}'"));
        let step = step(&fx, &[]);

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        assert!(outcome.error.is_none(), "got: {:?}", outcome.error);

        let args = std::fs::read_to_string(fx.workspace.root.join("args.txt")).unwrap();
        assert!(args.contains("--model\nsonnet\n"), "got: {args}");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_failure_with_truncated_stderr() {
        let fx = fixture("echo boom >&2\nyes x | head -n 1000 >&2\nexit 3");
        let step = step(&fx, &[]);

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        match outcome.error {
            Some(StepFailure::Execution(msg)) => {
                assert!(msg.contains("boom"), "got: {msg}");
                assert!(msg.len() < 600, "stderr not truncated: {} chars", msg.len());
            }
            other => panic!("expected execution failure, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_turn_limit_exhaustion_fails_step() {
        let fx = fixture(
            r#"echo '{"type":"result","subtype":"error_max_turns","is_error":true,"usage":{"input_tokens":5,"output_tokens":5}}'"#,
        );
        let step = step(&fx, &[]);

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        assert_eq!(outcome.resource_usage, 10);
        match outcome.error {
            Some(StepFailure::Execution(msg)) => {
                assert!(msg.contains("turn limit of 10"), "got: {msg}")
            }
            other => panic!("expected execution failure, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_output_after_clean_exit() {
        let fx = fixture("echo 'not json at all'");
        let step = step(&fx, &["project/plan.md"]);

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        assert_eq!(outcome.resource_usage, 0);
        assert_eq!(outcome.agent_output.as_deref(), Some("not json at all"));
        match outcome.error {
            Some(StepFailure::OutputMissing { paths }) => {
                assert_eq!(paths, vec!["project/plan.md".to_string()])
            }
            other => panic!("expected missing output, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_result_message_is_kept_as_agent_output() {
        let fx = fixture(
            r#"echo '{"type":"result","subtype":"success","is_error":false,"result":"Wrote the design doc.","usage":{"input_tokens":1,"output_tokens":2}}'"#,
        );
        let step = step(&fx, &[]);

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        assert!(outcome.error.is_none(), "got: {:?}", outcome.error);
        assert_eq!(outcome.agent_output.as_deref(), Some("Wrote the design doc."));
    }

    #[tokio::test]
    async fn test_long_stdout_is_clipped() {
        let fx = fixture("yes 'progress line' | head -n 1000
echo 'final line'");
        let step = step(&fx, &[]);

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        let transcript = outcome.agent_output.unwrap();
        assert!(transcript.starts_with('['), "got: {}", &transcript[..40]);
        assert!(transcript.ends_with("final line"));
        assert!(transcript.chars().count() < AGENT_OUTPUT_LIMIT + 40);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let fx = fixture("sleep 30");
        let mut step = step(&fx, &[]);
        step.timeout_secs = 1;

        let started = std::time::Instant::now();
        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        match outcome.error {
            Some(StepFailure::Timeout { secs }) => assert_eq!(secs, 1),
            other => panic!("expected timeout, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_prompt_template() {
        let fx = fixture(&format!("echo '{SUCCESS_JSON}'"));
        let mut step = step(&fx, &[]);
        step.prompt_strategy = Some("/definitely/not/here.md".into());

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        match outcome.error {
            Some(StepFailure::Execution(msg)) => {
                assert!(msg.contains("prompt template"), "got: {msg}")
            }
            other => panic!("expected execution failure, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let mut fx = fixture("true");
        fx.executor = ClaudeCodeExecutor::new(ClaudeConfig {
            binary: "/nonexistent/claude".into(),
            ..ClaudeConfig::default()
        });
        let step = step(&fx, &[]);

        let outcome = fx.executor.execute(&step, &fx.workspace, &context(&fx)).await;
        match outcome.error {
            Some(StepFailure::Execution(msg)) => {
                assert!(msg.contains("failed to spawn"), "got: {msg}")
            }
            other => panic!("expected execution failure, got: {other:?}"),
        }
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
