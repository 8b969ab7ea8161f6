//! Shared domain types for Pipewright.
//!
//! This crate contains the declarative workflow model, the persisted state
//! snapshot, global configuration, and the store error type shared by the
//! core and infrastructure crates.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod state;
pub mod workflow;
