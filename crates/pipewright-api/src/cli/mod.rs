//! CLI command definitions for the `pipewright` binary.
//!
//! Uses clap derive macros for argument parsing. Handlers live in
//! [`workflow`] and return the process exit code.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use pipewright_core::workflow::orchestrator::{ErrorClass, OrchestratorError};

/// Run multi-step agent workflows with durable, resumable state.
#[derive(Parser)]
#[command(name = "pipewright", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans via OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Directory holding run workspaces (overrides config.toml).
    #[arg(long, global = true, env = "PIPEWRIGHT_WORKSPACES", value_name = "DIR")]
    pub workspaces: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow, create a workspace, and run every step.
    Run {
        /// Path to the workflow YAML file.
        workflow: PathBuf,

        /// Problem statement copied into the workspace's context/ directory.
        #[arg(long, value_name = "FILE")]
        problem: Option<PathBuf>,

        /// Run every step on this backend (e.g. `mock`).
        #[arg(long, value_name = "NAME")]
        backend: Option<String>,
    },

    /// Continue a failed or interrupted run from its first incomplete step.
    Resume {
        /// Workflow id (the workspace number, e.g. 00001).
        workflow_id: String,

        /// Workflow YAML to use instead of the recorded definition path.
        #[arg(long, value_name = "FILE")]
        workflow: Option<PathBuf>,

        /// Run remaining steps on this backend.
        #[arg(long, value_name = "NAME")]
        backend: Option<String>,
    },

    /// Show per-step status of a run.
    Status {
        /// Workflow id.
        workflow_id: String,
    },

    /// List all recorded runs.
    #[command(alias = "ls")]
    List,

    /// Delete a run's workspace and recorded state.
    #[command(alias = "rm")]
    Delete {
        /// Workflow id.
        workflow_id: String,

        /// Delete even if the run is still marked in progress.
        #[arg(long, short)]
        force: bool,
    },

    /// Validate a workflow file and print its execution order.
    Validate {
        /// Path to the workflow YAML file.
        workflow: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

impl Commands {
    /// Backend override requested by this command, if any.
    pub fn backend_override(&self) -> Option<String> {
        match self {
            Commands::Run { backend, .. } | Commands::Resume { backend, .. } => backend.clone(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_EXECUTION: u8 = 1;
pub const EXIT_VALIDATION: u8 = 2;
pub const EXIT_DEPENDENCY: u8 = 3;
pub const EXIT_NOT_FOUND: u8 = 4;
pub const EXIT_CORRUPTION: u8 = 5;
pub const EXIT_INTERRUPTED: u8 = 130;

pub fn exit_code_for(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::Execution => EXIT_EXECUTION,
        ErrorClass::Validation => EXIT_VALIDATION,
        ErrorClass::Dependency => EXIT_DEPENDENCY,
        ErrorClass::NotFound => EXIT_NOT_FOUND,
        ErrorClass::Corruption => EXIT_CORRUPTION,
        ErrorClass::Interrupted => EXIT_INTERRUPTED,
    }
}

/// Exit code for an error that escaped a handler.
///
/// Engine errors keep their class; anything else (config, I/O at the CLI
/// boundary) is an execution error.
pub fn exit_code_for_error(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<OrchestratorError>())
        .map(|e| exit_code_for(e.class()))
        .unwrap_or(EXIT_EXECUTION)
}
