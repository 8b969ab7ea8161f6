//! Application state wiring the engine together.
//!
//! The orchestrator is generic over its state store; AppState pins it to the
//! filesystem implementation and registers the available backends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use pipewright_core::agent::AgentRegistry;
use pipewright_core::agent::mock::MockAgentExecutor;
use pipewright_core::workflow::orchestrator::Orchestrator;
use pipewright_core::workspace::WorkspaceManager;
use pipewright_infra::agent::ClaudeCodeExecutor;
use pipewright_infra::config::{load_global_config, resolve_workspaces_dir};
use pipewright_infra::filesystem::{FileStateStore, resolve_data_dir};

/// Concrete orchestrator pinned to the filesystem state store.
pub type ConcreteOrchestrator = Orchestrator<FileStateStore>;

/// Shared application state used by every command handler.
pub struct AppState {
    pub orchestrator: ConcreteOrchestrator,
    pub workspaces_dir: PathBuf,
}

impl AppState {
    /// Resolve directories, load config, and wire the orchestrator.
    pub async fn init(
        workspaces_override: Option<&Path>,
        backend_override: Option<String>,
    ) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await;
        let workspaces_dir = resolve_workspaces_dir(&config, &data_dir, workspaces_override);

        let mut agents = AgentRegistry::new();
        agents
            .register(MockAgentExecutor::new(Duration::from_millis(
                config.mock.delay_ms,
            )))
            .register(ClaudeCodeExecutor::new(config.claude.clone()));

        let workspaces = WorkspaceManager::new(&workspaces_dir).with_context(|| {
            format!("Failed to scan workspaces in {}", workspaces_dir.display())
        })?;
        let store = FileStateStore::new(&workspaces_dir);

        let orchestrator = Orchestrator::new(store, agents, workspaces)
            .with_default_backend(config.default_backend.clone())
            .with_backend_override(backend_override);

        tracing::debug!(
            data_dir = %data_dir.display(),
            workspaces_dir = %workspaces_dir.display(),
            default_backend = %config.default_backend,
            "application state initialized"
        );

        Ok(Self {
            orchestrator,
            workspaces_dir,
        })
    }
}
