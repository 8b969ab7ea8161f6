//! Workflow run subcommands.
//!
//! Provides run, resume, status, list, delete, and validate. Each handler returns the
//! process exit code; engine errors are propagated and classified in `main`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use pipewright_core::agent::mock::MOCK_BACKEND;
use pipewright_core::workflow::dag::StepGraph;
use pipewright_core::workflow::definition::{
    WorkflowError, discover_workflows, load_workflow_file, missing_prompt_files,
};
use pipewright_core::workflow::orchestrator::{OrchestratorError, RunRequest};
use pipewright_types::state::{StepStatus, WorkflowState, WorkflowStatus};
use pipewright_types::workflow::WorkflowDefinition;

use super::{EXIT_EXECUTION, EXIT_SUCCESS};
use crate::state::{AppState, ConcreteOrchestrator};

/// Directory scanned for a matching definition when a snapshot does not
/// record where its workflow came from.
const WORKFLOWS_DIR: &str = "workflows";

/// Output switches shared by every handler.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub json: bool,
    pub quiet: bool,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &Path,
    problem: Option<PathBuf>,
    out: OutputMode,
) -> Result<u8> {
    let def = load_definition(workflow)?;
    check_prompt_files(&state.orchestrator, &def)?;

    if let Some(problem) = &problem {
        if !problem.is_file() {
            anyhow::bail!("Problem file not found: {}", problem.display());
        }
    }

    let request = RunRequest {
        problem_file: problem,
        definition_path: Some(absolute(workflow)),
        ..RunRequest::default()
    };

    if !out.json && !out.quiet {
        println!();
        println!(
            "  {} Running workflow '{}' ({} steps)",
            style("*").cyan().bold(),
            style(&def.name).cyan(),
            def.steps.len()
        );
    }

    let result = state.orchestrator.run(&def, request).await;
    report_outcome(result, out)
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(
    state: &AppState,
    workflow_id: &str,
    workflow: Option<&Path>,
    out: OutputMode,
) -> Result<u8> {
    let snapshot = state.orchestrator.status(workflow_id).await?;
    let (path, def) = resolve_definition(&snapshot, workflow, Path::new(WORKFLOWS_DIR))?;
    check_prompt_files(&state.orchestrator, &def)?;

    if !out.json && !out.quiet {
        println!();
        println!(
            "  {} Resuming run {} of '{}' ({} of {} steps completed)",
            style("*").cyan().bold(),
            style(workflow_id).cyan(),
            def.name,
            snapshot.completed_steps().len(),
            def.steps.len()
        );
        println!("  Definition: {}", style(path.display()).dim());
    }

    let result = state.orchestrator.resume(workflow_id, &def).await;
    report_outcome(result, out)
}

/// Pick the definition for a resumed run.
///
/// Priority: explicit `--workflow`, the path recorded in the snapshot, then
/// the first definition under `search_dir` whose name matches.
fn resolve_definition(
    snapshot: &WorkflowState,
    explicit: Option<&Path>,
    search_dir: &Path,
) -> Result<(PathBuf, WorkflowDefinition)> {
    if let Some(path) = explicit {
        return Ok((path.to_path_buf(), load_definition(path)?));
    }

    if let Some(path) = snapshot.definition_path.as_deref().filter(|p| p.is_file()) {
        return Ok((path.to_path_buf(), load_definition(path)?));
    }

    let found = discover_workflows(search_dir)
        .map_err(OrchestratorError::from)?
        .into_iter()
        .find(|(_, def)| def.name == snapshot.workflow_name);
    match found {
        Some(found) => Ok(found),
        None => Err(OrchestratorError::from(WorkflowError::ValidationError(format!(
            "cannot locate the definition of workflow '{}'; pass --workflow <FILE>",
            snapshot.workflow_name
        )))
        .into()),
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(state: &AppState, workflow_id: &str, out: OutputMode) -> Result<u8> {
    let snapshot = state.orchestrator.status(workflow_id).await?;

    // The ready set needs the definition; a run whose YAML moved still
    // gets its step table.
    let ready: Option<Vec<String>> = snapshot
        .definition_path
        .as_deref()
        .and_then(|p| load_workflow_file(p).ok())
        .and_then(|def| {
            let graph = StepGraph::build(&def).ok()?;
            Some(graph.ready_set(&snapshot).into_iter().map(String::from).collect())
        });

    if out.json {
        let mut value = serde_json::to_value(&snapshot)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("ready".to_string(), serde_json::json!(ready));
            obj.insert("pending".to_string(), serde_json::json!(snapshot.pending_steps()));
            obj.insert("has_failures".to_string(), serde_json::json!(snapshot.has_failures()));
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(EXIT_SUCCESS);
    }

    println!();
    println!(
        "  {} Run {} ({})",
        style("Workflow:").bold(),
        style(&snapshot.workflow_id).cyan(),
        style(&snapshot.workflow_name).cyan()
    );
    println!("  Status: {}", snapshot.status);
    println!("  Created: {}", snapshot.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated: {}", snapshot.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(duration) = snapshot.duration() {
        println!("  Duration: {}", format_duration(duration));
    }
    println!("  Usage: {}", snapshot.total_resource_usage);
    println!(
        "  Steps: {} completed, {} pending",
        snapshot.completed_steps().len(),
        snapshot.pending_steps().len()
    );
    if let Some(path) = &snapshot.workspace_path {
        println!("  Workspace: {}", style(path.display()).dim());
    }
    if snapshot.has_failures() {
        if let Some(err) = failure_message(&snapshot) {
            println!("  Last error: {}", style(err).red());
        }
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Usage"),
            Cell::new("Outputs"),
            Cell::new("Last error"),
        ]);

    for step in ordered_steps(&snapshot) {
        let usage: u64 = step.attempts.iter().map(|a| a.resource_usage).sum();
        let last_error = step
            .last_attempt()
            .and_then(|a| a.error.clone())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&step.step_id),
            format_step_status(step.status),
            Cell::new(step.attempts.len()),
            Cell::new(usage),
            Cell::new(step.produced_outputs.len()),
            Cell::new(truncate(&last_error, 60)),
        ]);
    }
    println!("{table}");

    match ready {
        Some(ready) if !ready.is_empty() => {
            println!();
            println!("  Ready to run: {}", style(ready.join(", ")).green());
        }
        Some(_) => {}
        None => {
            println!();
            println!("  {}", style("Ready set unavailable (definition file not found)").dim());
        }
    }
    if snapshot.status != WorkflowStatus::Completed {
        println!(
            "  Resume with: {}",
            style(format!("pipewright resume {}", snapshot.workflow_id)).dim()
        );
    }
    println!();

    Ok(EXIT_SUCCESS)
}

/// Steps in execution order: those with attempts by start time, then the
/// untouched ones by id.
fn ordered_steps(snapshot: &WorkflowState) -> Vec<&pipewright_types::state::StepResult> {
    let mut steps: Vec<_> = snapshot.steps.values().collect();
    steps.sort_by(|a, b| match (a.started_at, b.started_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.step_id.cmp(&b.step_id),
    });
    steps
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(state: &AppState, out: OutputMode) -> Result<u8> {
    let runs = state.orchestrator.list().await?;

    if out.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(EXIT_SUCCESS);
    }

    let listed: Vec<&str> = runs.iter().map(|r| r.workflow_id.as_str()).collect();
    let unreadable = without_state(
        state
            .orchestrator
            .workspaces()
            .ids()
            .map_err(OrchestratorError::from)?,
        &listed,
    );

    if runs.is_empty() && unreadable.is_empty() {
        println!();
        println!("  No workflow runs in {}.", state.workspaces_dir.display());
        println!(
            "  Start one with: {}",
            style("pipewright run <workflow.yaml>").dim()
        );
        println!();
        return Ok(EXIT_SUCCESS);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Updated"),
        ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(&run.workflow_id),
            Cell::new(&run.workflow_name),
            format_workflow_status(run.status),
            Cell::new(run.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    if !runs.is_empty() {
        println!();
        println!("{table}");
    }
    if !unreadable.is_empty() {
        println!();
        println!(
            "  {} Workspaces without readable state: {}",
            style("!").yellow().bold(),
            unreadable.join(", ")
        );
        println!(
            "  Inspect with {} or remove with {}",
            style("pipewright status <id>").dim(),
            style("pipewright delete <id>").dim()
        );
    }
    println!();

    Ok(EXIT_SUCCESS)
}

/// Workspace ids that have no entry among the listed runs.
fn without_state(workspace_ids: Vec<String>, listed: &[&str]) -> Vec<String> {
    workspace_ids
        .into_iter()
        .filter(|id| !listed.contains(&id.as_str()))
        .collect()
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub async fn handle_delete(
    state: &AppState,
    workflow_id: &str,
    force: bool,
    out: OutputMode,
) -> Result<u8> {
    let root = state
        .orchestrator
        .delete(workflow_id, force)
        .await
        .with_context(|| format!("Failed to delete run {workflow_id}"))?;

    if out.json {
        let value = serde_json::json!({
            "workflow_id": workflow_id,
            "deleted": true,
            "workspace_path": root,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if !out.quiet {
        println!();
        println!(
            "  {} Deleted run {} ({})",
            style("✓").green().bold(),
            style(workflow_id).cyan(),
            style(root.display()).dim()
        );
        println!();
    }

    Ok(EXIT_SUCCESS)
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn handle_validate(state: &AppState, workflow: &Path, out: OutputMode) -> Result<u8> {
    let def = load_definition(workflow)?;
    let order = state.orchestrator.validate(&def)?;
    check_prompt_files(&state.orchestrator, &def)?;

    if out.json {
        let value = serde_json::json!({
            "name": def.name,
            "valid": true,
            "steps": def.steps.len(),
            "execution_order": order,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(EXIT_SUCCESS);
    }

    if !out.quiet {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("✓").green().bold(),
            style(&def.name).cyan()
        );
        println!();
        for (position, step_id) in order.iter().enumerate() {
            let backend = def
                .step(step_id)
                .map(|s| state.orchestrator.backend_for(s))
                .unwrap_or_default();
            println!("  {:>3}. {step_id} {}", position + 1, style(format!("[{backend}]")).dim());
        }
        println!();
    }

    Ok(EXIT_SUCCESS)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(path)
        .map_err(OrchestratorError::from)
        .with_context(|| format!("Failed to load workflow {}", path.display()))
}

/// Reject steps whose prompt template is missing. The mock backend treats
/// its strategy as a directive string, so mock steps are exempt.
fn check_prompt_files(orchestrator: &ConcreteOrchestrator, def: &WorkflowDefinition) -> Result<()> {
    let missing: Vec<String> = missing_prompt_files(def, Path::new("."))
        .into_iter()
        .filter(|(step_id, _)| {
            def.step(step_id)
                .is_some_and(|s| orchestrator.backend_for(s) != MOCK_BACKEND)
        })
        .map(|(step_id, path)| format!("step '{step_id}': {}", path.display()))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }
    Err(OrchestratorError::from(WorkflowError::ValidationError(format!(
        "prompt template not found ({})",
        missing.join("; ")
    )))
    .into())
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Print the result of `run`/`resume` and map it to an exit code.
fn report_outcome(
    result: std::result::Result<WorkflowState, OrchestratorError>,
    out: OutputMode,
) -> Result<u8> {
    let state = match result {
        Ok(state) => state,
        Err(OrchestratorError::Interrupted {
            workflow_id,
            step_id,
        }) => {
            if !out.json {
                eprintln!();
                eprintln!("  {} Interrupted.", style("!").yellow().bold());
                eprintln!(
                    "  Resume with: {}",
                    style(format!("pipewright resume {workflow_id}")).cyan()
                );
            }
            return Err(OrchestratorError::Interrupted {
                workflow_id,
                step_id,
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    let code = if state.status == WorkflowStatus::Completed {
        EXIT_SUCCESS
    } else {
        EXIT_EXECUTION
    };

    if out.json {
        let value = serde_json::json!({
            "workflow_id": state.workflow_id,
            "workflow_name": state.workflow_name,
            "status": state.status,
            "completed_steps": state.completed_steps(),
            "failed_steps": state.failed_steps(),
            "total_resource_usage": state.total_resource_usage,
            "error": failure_message(&state),
            "workspace_path": state.workspace_path,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(code);
    }

    if out.quiet && code == EXIT_SUCCESS {
        return Ok(code);
    }

    println!();
    if code == EXIT_SUCCESS {
        println!(
            "  {} Workflow '{}' completed (run {})",
            style("✓").green().bold(),
            style(&state.workflow_name).cyan(),
            state.workflow_id
        );
    } else {
        let failed = state.failed_steps().first().map(|s| s.to_string());
        println!(
            "  {} Workflow '{}' failed at step '{}' (run {})",
            style("✗").red().bold(),
            style(&state.workflow_name).cyan(),
            failed.as_deref().unwrap_or("?"),
            state.workflow_id
        );
        if let Some(err) = failure_message(&state) {
            println!("  Error: {}", style(err).red());
        }
    }
    println!(
        "  Steps: {}/{} completed, usage {}",
        state.completed_steps().len(),
        state.steps.len(),
        state.total_resource_usage
    );
    if let Some(duration) = state.duration() {
        println!("  Duration: {}", format_duration(duration));
    }
    if let Some(path) = &state.workspace_path {
        println!("  Workspace: {}", style(path.display()).dim());
    }
    if code != EXIT_SUCCESS {
        println!(
            "  Resume with: {}",
            style(format!("pipewright resume {}", state.workflow_id)).dim()
        );
    }
    println!();

    Ok(code)
}

/// Error of the most recent attempt of the first failed step.
fn failure_message(state: &WorkflowState) -> Option<String> {
    state
        .steps
        .values()
        .find(|s| s.status == StepStatus::Failed)
        .and_then(|s| s.last_attempt())
        .and_then(|a| a.error.clone())
}

fn format_step_status(status: StepStatus) -> Cell {
    match status {
        StepStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        StepStatus::InProgress => Cell::new("in_progress").fg(Color::Blue),
        StepStatus::Completed => Cell::new("completed").fg(Color::Green),
        StepStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}

fn format_workflow_status(status: WorkflowStatus) -> Cell {
    match status {
        WorkflowStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        WorkflowStatus::InProgress => Cell::new("in_progress").fg(Color::Blue),
        WorkflowStatus::Completed => Cell::new("completed").fg(Color::Green),
        WorkflowStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    if millis < 1_000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1_000.0)
    } else {
        format!("{}m {}s", millis / 60_000, (millis % 60_000) / 1_000)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::workflow::StepDefinition;
    use tempfile::TempDir;

    fn definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.into(),
            description: String::new(),
            steps: vec![StepDefinition::new("only")],
        }
    }

    fn write_yaml(dir: &Path, file: &str, name: &str) -> PathBuf {
        let path = dir.join(file);
        std::fs::write(
            &path,
            format!("name: {name}\nsteps:\n  - id: only\n    timeout: 60\n"),
        )
        .unwrap();
        path
    }

    #[test]
    fn resolve_definition_prefers_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let recorded = write_yaml(tmp.path(), "recorded.yaml", "build");
        let explicit = write_yaml(tmp.path(), "explicit.yaml", "build");

        let mut snapshot = WorkflowState::new("00001", &definition("build"));
        snapshot.definition_path = Some(recorded);

        let (path, def) = resolve_definition(&snapshot, Some(&explicit), tmp.path()).unwrap();
        assert_eq!(path, explicit);
        assert_eq!(def.name, "build");
    }

    #[test]
    fn resolve_definition_uses_recorded_path() {
        let tmp = TempDir::new().unwrap();
        let recorded = write_yaml(tmp.path(), "recorded.yaml", "build");

        let mut snapshot = WorkflowState::new("00001", &definition("build"));
        snapshot.definition_path = Some(recorded.clone());

        let (path, _) = resolve_definition(&snapshot, None, Path::new("/nonexistent")).unwrap();
        assert_eq!(path, recorded);
    }

    #[test]
    fn resolve_definition_falls_back_to_discovery_by_name() {
        let tmp = TempDir::new().unwrap();
        write_yaml(tmp.path(), "a.yaml", "other");
        let wanted = write_yaml(tmp.path(), "b.yml", "build");

        let mut snapshot = WorkflowState::new("00001", &definition("build"));
        snapshot.definition_path = Some(tmp.path().join("moved-away.yaml"));

        let (path, def) = resolve_definition(&snapshot, None, tmp.path()).unwrap();
        assert_eq!(path, wanted);
        assert_eq!(def.name, "build");
    }

    #[test]
    fn resolve_definition_reports_validation_error_when_nothing_matches() {
        let tmp = TempDir::new().unwrap();
        let snapshot = WorkflowState::new("00001", &definition("build"));

        let err = resolve_definition(&snapshot, None, tmp.path()).unwrap_err();
        assert_eq!(super::super::exit_code_for_error(&err), super::super::EXIT_VALIDATION);
        let msg = err.to_string();
        assert!(msg.contains("--workflow"), "got: {msg}");
    }

    #[test]
    fn without_state_keeps_unlisted_ids_in_order() {
        let ids = vec!["00001".to_string(), "00002".to_string(), "00003".to_string()];
        assert_eq!(without_state(ids, &["00002"]), vec!["00001", "00003"]);
        assert!(without_state(Vec::new(), &["00001"]).is_empty());
    }

    #[test]
    fn format_duration_ranges() {
        assert_eq!(format_duration(chrono::Duration::milliseconds(250)), "250ms");
        assert_eq!(format_duration(chrono::Duration::milliseconds(1_500)), "1.5s");
        assert_eq!(format_duration(chrono::Duration::seconds(125)), "2m 5s");
    }

    #[test]
    fn truncate_adds_ellipsis() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
