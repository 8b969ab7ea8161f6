//! Isolated per-run workspaces.
//!
//! Each run gets a numbered directory under the manager's base dir:
//!
//! ```text
//! {base}/00001/
//!     project/   -- artifacts the steps build
//!     context/   -- inputs such as the problem statement
//!     state/     -- workflow_state.json plus timestamped .bak copies
//!     logs/
//! ```
//!
//! The workspace id doubles as the workflow id of the run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use thiserror::Error;

/// Snapshot file name inside a workspace's `state/` dir.
pub const STATE_FILE: &str = "workflow_state.json";

/// Errors from workspace management.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workspace not found: {0}")]
    NotFound(String),

    #[error("invalid workspace id '{0}' (expected digits only)")]
    InvalidId(String),
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Directory set for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub id: String,
    pub root: PathBuf,
    pub project: PathBuf,
    pub context: PathBuf,
    pub state: PathBuf,
    pub logs: PathBuf,
}

impl WorkspacePaths {
    /// Paths for workspace `id` rooted at `root`. Does not touch the disk.
    pub fn at(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            id: id.into(),
            project: root.join("project"),
            context: root.join("context"),
            state: root.join("state"),
            logs: root.join("logs"),
            root,
        }
    }

    /// Resolve a workspace-relative path.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Canonical snapshot file of this run.
    pub fn state_file(&self) -> PathBuf {
        self.state.join(STATE_FILE)
    }

    fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.project, &self.context, &self.state, &self.logs] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Allocates and opens numbered workspaces under a base directory.
///
/// The build counter lives in this value, not in process-wide state, so two
/// managers over different base dirs never interfere.
#[derive(Debug)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    next_build: AtomicU32,
}

impl WorkspaceManager {
    /// Create a manager, seeding the counter from the highest existing
    /// workspace number.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let base_dir = base_dir.into();
        let highest = scan_ids(&base_dir)?.into_iter().max().unwrap_or(0);
        Ok(Self {
            base_dir,
            next_build: AtomicU32::new(highest + 1),
        })
    }

    /// Allocate the next free build number and create its directory tree.
    pub fn create(&self) -> Result<WorkspacePaths, WorkspaceError> {
        std::fs::create_dir_all(&self.base_dir)?;
        loop {
            let n = self.next_build.fetch_add(1, Ordering::SeqCst);
            let id = format!("{n:05}");
            let root = self.base_dir.join(&id);
            match std::fs::create_dir(&root) {
                Ok(()) => {
                    let paths = WorkspacePaths::at(id, root);
                    paths.create_dirs()?;
                    tracing::debug!(workspace_id = %paths.id, root = %paths.root.display(), "created workspace");
                    return Ok(paths);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Locate an existing workspace without touching its contents.
    pub fn find(&self, id: &str) -> Result<WorkspacePaths, WorkspaceError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(WorkspaceError::InvalidId(id.to_string()));
        }
        let root = self.base_dir.join(id);
        if !root.is_dir() {
            return Err(WorkspaceError::NotFound(id.to_string()));
        }
        Ok(WorkspacePaths::at(id, root))
    }

    /// Open an existing workspace, recreating any missing subdirectory.
    pub fn open(&self, id: &str) -> Result<WorkspacePaths, WorkspaceError> {
        let paths = self.find(id)?;
        paths.create_dirs()?;
        Ok(paths)
    }

    /// Remove a workspace and everything in it. Returns the removed root.
    pub fn delete(&self, id: &str) -> Result<PathBuf, WorkspaceError> {
        let paths = self.find(id)?;
        std::fs::remove_dir_all(&paths.root)?;
        tracing::info!(workspace_id = %id, root = %paths.root.display(), "deleted workspace");
        Ok(paths.root)
    }

    /// Copy the current snapshot to `state/workflow_state_<timestamp>.json.bak`.
    ///
    /// Returns `None` when the workspace has no snapshot file yet.
    pub fn backup_state(&self, workspace: &WorkspacePaths) -> Result<Option<PathBuf>, WorkspaceError> {
        let current = workspace.state_file();
        if !current.is_file() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let backup = workspace
            .state
            .join(format!("workflow_state_{stamp}.json.bak"));
        std::fs::copy(&current, &backup)?;
        tracing::debug!(workspace_id = %workspace.id, backup = %backup.display(), "backed up state snapshot");
        Ok(Some(backup))
    }

    /// Existing workspace ids, ascending.
    pub fn ids(&self) -> Result<Vec<String>, WorkspaceError> {
        let mut ids = scan_ids(&self.base_dir)?;
        ids.sort_unstable();
        Ok(ids.into_iter().map(|n| format!("{n:05}")).collect())
    }

    /// Copy `src` into the workspace's `context/` dir, keeping its file name
    /// unless `name` is given. Returns the destination path.
    pub fn copy_into_context(
        &self,
        workspace: &WorkspacePaths,
        src: &Path,
        name: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError> {
        let file_name = match name {
            Some(n) => PathBuf::from(n),
            None => src
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| WorkspaceError::NotFound(src.display().to_string()))?,
        };
        let dest = workspace.context.join(file_name);
        std::fs::copy(src, &dest)?;
        Ok(dest)
    }
}

fn scan_ids(base_dir: &Path) -> Result<Vec<u32>, WorkspaceError> {
    if !base_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(n) = entry
            .file_name()
            .to_str()
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            .and_then(|s| s.parse::<u32>().ok())
        {
            ids.push(n);
        }
    }
    Ok(ids)
}
