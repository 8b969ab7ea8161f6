//! Global configuration types for Pipewright.
//!
//! `GlobalConfig` represents the top-level `config.toml` that selects the
//! workspaces directory, the default backend, and backend settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::workflow::DEFAULT_BACKEND;

/// Top-level configuration.
///
/// Loaded from `~/.pipewright/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Where run workspaces are created. Defaults to `{data_dir}/workspaces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspaces_dir: Option<PathBuf>,

    /// Backend for steps that do not name one.
    #[serde(default = "default_backend")]
    pub default_backend: String,

    #[serde(default)]
    pub mock: MockConfig,

    #[serde(default)]
    pub claude: ClaudeConfig,
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            workspaces_dir: None,
            default_backend: default_backend(),
            mock: MockConfig::default(),
            claude: ClaudeConfig::default(),
        }
    }
}

/// Settings for the deterministic mock backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    /// Artificial delay applied by the `MOCK_SLOW` directive.
    #[serde(default = "default_mock_delay_ms")]
    pub delay_ms: u64,
}

fn default_mock_delay_ms() -> u64 {
    2000
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_mock_delay_ms(),
        }
    }
}

/// Settings for the `claude` CLI backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Executable name or path.
    #[serde(default = "default_claude_binary")]
    pub binary: String,
    /// Model used when a step does not select one.
    #[serde(default = "default_claude_model")]
    pub default_model: String,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    /// Appended verbatim to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_claude_binary() -> String {
    "claude".to_string()
}

fn default_claude_model() -> String {
    "sonnet".to_string()
}

fn default_allowed_tools() -> Vec<String> {
    ["Read", "Write", "Edit", "Glob", "Grep", "Bash"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: default_claude_binary(),
            default_model: default_claude_model(),
            allowed_tools: default_allowed_tools(),
            extra_args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_config_default_values() {
        let config = GlobalConfig::default();
        assert!(config.workspaces_dir.is_none());
        assert_eq!(config.default_backend, "claude_code");
        assert_eq!(config.mock.delay_ms, 2000);
        assert_eq!(config.claude.binary, "claude");
        assert_eq!(config.claude.allowed_tools.len(), 6);
    }

    #[test]
    fn test_global_config_deserialize_with_defaults() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config.default_backend, "claude_code");
        assert_eq!(config.claude.default_model, "sonnet");
        assert!(config.claude.extra_args.is_empty());
    }

    #[test]
    fn test_global_config_deserialize_with_values() {
        let toml_str = r#"
workspaces_dir = "/tmp/runs"
default_backend = "mock"

[mock]
delay_ms = 10

[claude]
binary = "/opt/claude/bin/claude"
allowed_tools = ["Read", "Write"]
extra_args = ["--verbose"]
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workspaces_dir, Some(PathBuf::from("/tmp/runs")));
        assert_eq!(config.default_backend, "mock");
        assert_eq!(config.mock.delay_ms, 10);
        assert_eq!(config.claude.binary, "/opt/claude/bin/claude");
        assert_eq!(config.claude.default_model, "sonnet");
        assert_eq!(config.claude.allowed_tools, vec!["Read", "Write"]);
        assert_eq!(config.claude.extra_args, vec!["--verbose"]);
    }
}
