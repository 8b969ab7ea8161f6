//! Infrastructure layer for Pipewright.
//!
//! Contains implementations of the ports defined in `pipewright-core`:
//! the atomic filesystem `StateStore`, the `claude` CLI executor, and
//! configuration/data directory loading.

pub mod agent;
pub mod config;
pub mod filesystem;
