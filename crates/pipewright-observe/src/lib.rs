//! Observability setup for Pipewright: structured logging and optional
//! OpenTelemetry trace export.

pub mod tracing_setup;
