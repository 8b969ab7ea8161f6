//! Business logic and port definitions for Pipewright.
//!
//! This crate defines the workflow engine (resolver, checkpointing,
//! orchestrator), the `StateStore` port that the infrastructure layer
//! implements, and the `AgentExecutor` abstraction with its mock backend.
//! It depends only on `pipewright-types` -- never on `pipewright-infra` or
//! any process-spawning code.

pub mod agent;
pub mod repository;
pub mod workflow;
pub mod workspace;
