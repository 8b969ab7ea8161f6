//! Filesystem adapters for Pipewright.
//!
//! Provides the durable `StateStore` implementation and data directory
//! resolution.

pub mod state;

use std::path::PathBuf;

pub use state::FileStateStore;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `PIPEWRIGHT_DATA_DIR` environment variable
/// 2. `~/.pipewright`
/// 3. `.pipewright` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PIPEWRIGHT_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".pipewright");
    }

    PathBuf::from(".pipewright")
}
