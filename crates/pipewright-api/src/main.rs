//! Pipewright CLI entry point.
//!
//! Binary name: `pipewright`
//!
//! Parses CLI arguments, initializes tracing and application state, then
//! dispatches to the matching command handler. The process exit code
//! reflects the outcome class (see `cli::exit_code_for`).

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use console::style;

use cli::workflow::{self as handlers, OutputMode};
use cli::{Cli, Commands, exit_code_for_error};
use pipewright_observe::tracing_setup::{init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,pipewright_core=debug,pipewright_infra=debug",
        _ => "trace",
    };
    if let Err(e) = init_tracing(filter, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "pipewright", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let json = cli.json;
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            let code = exit_code_for_error(&err);
            if json {
                let out = serde_json::json!({
                    "error": format!("{err:#}"),
                    "exit_code": code,
                });
                println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
            } else {
                eprintln!("  {} {err:#}", style("error:").red().bold());
            }
            code
        }
    };

    shutdown_tracing();
    ExitCode::from(code)
}

async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    let backend = cli.command.backend_override();
    let state = AppState::init(cli.workspaces.as_deref(), backend).await?;

    // Ctrl+C / SIGTERM abort the active step; the run stays resumable.
    let token = state.orchestrator.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("interrupt received, stopping the active step");
        token.cancel();
    });

    let out = OutputMode {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Run {
            workflow, problem, ..
        } => handlers::handle_run(&state, &workflow, problem, out).await,
        Commands::Resume {
            workflow_id,
            workflow,
            ..
        } => handlers::handle_resume(&state, &workflow_id, workflow.as_deref(), out).await,
        Commands::Status { workflow_id } => {
            handlers::handle_status(&state, &workflow_id, out).await
        }
        Commands::List => handlers::handle_list(&state, out).await,
        Commands::Delete { workflow_id, force } => {
            handlers::handle_delete(&state, &workflow_id, force, out).await
        }
        Commands::Validate { workflow } => {
            handlers::handle_validate(&state, &workflow, out).await
        }
        Commands::Completions { .. } => unreachable!("handled before state init"),
    }
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed that source is ignored rather than
/// treated as a signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
