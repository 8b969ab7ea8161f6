//! Workflow engine core: definition parsing, ordering, and durable checkpointing.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/discovery
//! - `dag` -- step graph, deterministic ordering, cycle detection, ready set
//! - `checkpoint` -- transition recording on top of a `StateStore`
//! - `orchestrator` -- sequential run/resume loop with fail-fast semantics

pub mod checkpoint;
pub mod dag;
pub mod definition;
pub mod orchestrator;
