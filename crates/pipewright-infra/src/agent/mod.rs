//! Process-backed agent executors.

pub mod claude_code;

pub use claude_code::{CLAUDE_CODE_BACKEND, ClaudeCodeExecutor};
