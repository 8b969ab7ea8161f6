//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts YAML documents into `WorkflowDefinition`, validates structural
//! constraints (unique IDs, known dependencies, acyclicity, safe output
//! paths), and provides discovery for workflow files on disk.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use pipewright_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle. Lists the steps left unresolved.
    #[error("cycle detected among steps: {}", steps.join(", "))]
    CycleDetected { steps: Vec<String> },

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Accepts both a bare document and one wrapped in a top-level `workflow:`
/// key. Runs `validate_definition` after deserialization, so the returned
/// value is guaranteed to be structurally valid and acyclic.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let value: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    let wrapped = value.get("workflow").cloned();
    let body = wrapped.unwrap_or(value);

    let def: WorkflowDefinition =
        serde_yaml_ng::from_value(body).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty
/// - At least one step exists
/// - All step IDs are unique and non-empty
/// - All `depends_on` references point to existing step IDs, never to self
/// - Declared outputs are relative paths that stay inside the workspace
/// - Timeout and turn limit are > 0
/// - The dependency relation is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' depends on itself",
                    step.id
                )));
            }
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }

        for output in &step.declared_outputs {
            if !is_workspace_relative(output) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' output '{}' must be a relative path inside the workspace",
                    step.id, output
                )));
            }
        }

        if step.timeout_secs == 0 {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
        if step.turn_limit == 0 {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' turn_limit must be > 0",
                step.id
            )));
        }
    }

    dag::validate_dag(def)
}

/// Relative, never escaping, and naming at least one entry below the root.
fn is_workspace_relative(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    let mut named = false;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            _ => return false,
        }
    }
    named
}

/// Steps whose strategy reference names a file that does not exist.
///
/// Relative references are resolved against `base_dir`. Returns
/// `(step_id, resolved_path)` pairs in declaration order.
pub fn missing_prompt_files(def: &WorkflowDefinition, base_dir: &Path) -> Vec<(String, PathBuf)> {
    def.steps
        .iter()
        .filter_map(|step| {
            let strategy = step.prompt_strategy.as_deref()?;
            let path = base_dir.join(strategy);
            (!path.is_file()).then(|| (step.id.clone(), path))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::workflow::StepDefinition;

    fn minimal_workflow(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: String::new(),
            steps,
        }
    }

    fn step(id: &str, depends_on: Vec<&str>) -> StepDefinition {
        let mut s = StepDefinition::new(id);
        s.depends_on = depends_on.into_iter().map(String::from).collect();
        s
    }

    // -----------------------------------------------------------------------
    // YAML parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_wrapped_document() {
        let yaml = r#"
workflow:
  name: feature-build
  description: Research, plan and implement
  steps:
    - id: research
      wrapper: claude_code
      model: opus
      prompt_strategy: prompts/research.md
      outputs: [context/research.md]
      timeout: 600
      max_turns: 20
    - id: plan
      depends_on: [research]
      prompt_strategy: prompts/plan.md
      outputs: [project/plan.md]
"#;
        let def = parse_workflow_yaml(yaml).expect("should parse");
        assert_eq!(def.name, "feature-build");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].timeout_secs, 600);
        assert_eq!(def.steps[0].turn_limit, 20);
        assert_eq!(def.steps[0].model.as_deref(), Some("opus"));
        assert_eq!(def.steps[1].depends_on, vec!["research"]);
    }

    #[test]
    fn test_parse_bare_document_matches_wrapped() {
        let bare = r#"
name: tiny
steps:
  - id: only
    backend: mock
"#;
        let wrapped = r#"
workflow:
  name: tiny
  steps:
    - id: only
      backend: mock
"#;
        let def = parse_workflow_yaml(bare).expect("should parse");
        assert_eq!(def.steps[0].backend.as_deref(), Some("mock"));
        assert_eq!(parse_workflow_yaml(wrapped).expect("should parse"), def);
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        let err = parse_workflow_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)), "got: {err}");
    }

    #[test]
    fn test_parse_rejects_missing_steps() {
        let err = parse_workflow_yaml("name: x\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("steps"), "got: {msg}");
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let def = minimal_workflow("wf", vec![step("a", vec![]), step("a", vec![])]);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("duplicate step ID"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_unknown_dependency() {
        let def = minimal_workflow("wf", vec![step("a", vec!["nonexistent"])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_)));
        assert!(err.to_string().contains("unknown step"), "got: {err}");
    }

    #[test]
    fn test_validation_rejects_self_dependency() {
        let def = minimal_workflow("wf", vec![step("a", vec!["a"])]);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("depends on itself"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_empty_workflow() {
        let def = minimal_workflow("wf", vec![]);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("at least one step"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_empty_name() {
        let def = minimal_workflow(" ", vec![step("a", vec![])]);
        let msg = validate_definition(&def).unwrap_err().to_string();
        assert!(msg.contains("must not be empty"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_escaping_outputs() {
        for bad in ["/etc/passwd", "../outside.txt", "project/../../x", "", ".", "./", "././"] {
            let mut s = step("a", vec![]);
            s.declared_outputs = vec![bad.to_string()];
            let def = minimal_workflow("wf", vec![s]);
            let msg = validate_definition(&def).unwrap_err().to_string();
            assert!(msg.contains("relative path"), "{bad}: got: {msg}");
        }
    }

    #[test]
    fn test_validation_accepts_nested_outputs() {
        let mut s = step("a", vec![]);
        s.declared_outputs = vec!["project/src/main.rs".to_string(), "./notes.md".to_string()];
        let def = minimal_workflow("wf", vec![s]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut s = step("a", vec![]);
        s.timeout_secs = 0;
        let msg = validate_definition(&minimal_workflow("wf", vec![s]))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("timeout"), "got: {msg}");

        let mut s = step("a", vec![]);
        s.turn_limit = 0;
        let msg = validate_definition(&minimal_workflow("wf", vec![s]))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("turn_limit"), "got: {msg}");
    }

    #[test]
    fn test_validation_rejects_cycle() {
        let def = minimal_workflow("wf", vec![step("a", vec!["b"]), step("b", vec!["a"])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected { .. }), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // Filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn test_missing_prompt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("prompts")).unwrap();
        std::fs::write(dir.path().join("prompts/a.md"), "do a").unwrap();

        let mut a = step("a", vec![]);
        a.prompt_strategy = Some("prompts/a.md".to_string());
        let mut b = step("b", vec!["a"]);
        b.prompt_strategy = Some("prompts/b.md".to_string());
        let c = step("c", vec![]);
        let def = minimal_workflow("wf", vec![a, b, c]);

        let missing = missing_prompt_files(&def, dir.path());
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, "b");
        assert!(missing[0].1.ends_with("prompts/b.md"));
    }

    #[test]
    fn test_load_and_discover_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            dir.path().join("one.yaml"),
            "workflow:\n  name: one\n  steps:\n    - id: s\n",
        )
        .unwrap();
        std::fs::write(nested.join("two.yml"), "name: two\nsteps:\n  - id: s\n").unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "not: [a workflow").unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let def = load_workflow_file(&dir.path().join("one.yaml")).unwrap();
        assert_eq!(def.name, "one");

        let found = discover_workflows(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|(_, d)| d.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"one"));
        assert!(names.contains(&"two"));
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = discover_workflows(&dir.path().join("nope")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = load_workflow_file(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, WorkflowError::IoError(_)));
    }
}
