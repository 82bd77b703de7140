#![warn(missing_docs)]

//! # af-config
//!
//! Configuration loading for the pre-request script engine.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! execution_mode = "child_process"
//! max_script_size_kb = 256
//! max_storage_value_kb = 100
//! script_timeout_secs = 30
//!
//! [transport]
//! timeout_secs = 60
//! user_agent = "af-host/${AF_BUILD}"
//! max_redirects = 5
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AfConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Outbound transport settings.
    #[serde(default)]
    pub transport: TransportOverrides,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Execution mode: "in_process" (default) or "child_process".
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// Maximum script size in kilobytes.
    #[serde(default)]
    pub max_script_size_kb: Option<usize>,

    /// Maximum serialized size of a single local/session storage value, in kilobytes.
    #[serde(default)]
    pub max_storage_value_kb: Option<usize>,

    /// Maximum IPC frame size in megabytes (child-process mode).
    #[serde(default)]
    pub max_ipc_message_size_mb: Option<usize>,

    /// External evaluation timeout in seconds. `0` disables the timeout.
    #[serde(default)]
    pub script_timeout_secs: Option<u64>,
}

/// Outbound transport overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportOverrides {
    /// Default request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// User-Agent header sent when the request does not set one.
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Maximum redirects to follow. `0` disables redirects.
    #[serde(default)]
    pub max_redirects: Option<usize>,
}

impl AfConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: AfConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(mode) = &self.sandbox.execution_mode {
            match mode.as_str() {
                "in_process" | "child_process" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unsupported execution_mode '{}', supported: in_process, child_process",
                        other
                    )));
                }
            }
        }
        if self.sandbox.max_script_size_kb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_script_size_kb must be greater than 0".into(),
            ));
        }
        if self.sandbox.max_storage_value_kb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_storage_value_kb must be greater than 0".into(),
            ));
        }
        if self.sandbox.max_ipc_message_size_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_ipc_message_size_mb must be greater than 0".into(),
            ));
        }
        if self.transport.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "transport.timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Substitute `${NAME}` and `${NAME:-fallback}` from the process environment.
///
/// Unset names without a fallback, and an unterminated `${`, are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let inner = &after[..end];
        let (name, fallback) = match inner.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (inner, None),
        };
        match (std::env::var(name), fallback) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => out.push_str(&rest[start..start + 3 + end]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_empty_toml() {
        let config = AfConfig::from_toml("").unwrap();
        assert!(config.sandbox.execution_mode.is_none());
        assert!(config.transport.timeout_secs.is_none());
    }

    #[test]
    fn config_parses_sandbox_overrides() {
        let toml = r#"
            [sandbox]
            execution_mode = "child_process"
            max_script_size_kb = 512
            max_storage_value_kb = 64
            max_ipc_message_size_mb = 8
            script_timeout_secs = 10
        "#;

        let config = AfConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.sandbox.execution_mode.as_deref(),
            Some("child_process")
        );
        assert_eq!(config.sandbox.max_script_size_kb, Some(512));
        assert_eq!(config.sandbox.max_storage_value_kb, Some(64));
        assert_eq!(config.sandbox.max_ipc_message_size_mb, Some(8));
        assert_eq!(config.sandbox.script_timeout_secs, Some(10));
    }

    #[test]
    fn config_parses_transport_overrides() {
        let toml = r#"
            [transport]
            timeout_secs = 60
            user_agent = "af-host/test"
            max_redirects = 0
        "#;

        let config = AfConfig::from_toml(toml).unwrap();
        assert_eq!(config.transport.timeout_secs, Some(60));
        assert_eq!(config.transport.user_agent.as_deref(), Some("af-host/test"));
        assert_eq!(config.transport.max_redirects, Some(0));
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("AF_TEST_BUILD", "1.2.3");
        let toml = r#"
            [transport]
            user_agent = "af-host/${AF_TEST_BUILD}"
        "#;

        let config = AfConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.transport.user_agent.as_deref(),
            Some("af-host/1.2.3")
        );
        std::env::remove_var("AF_TEST_BUILD");
    }

    #[test]
    fn config_leaves_unknown_env_placeholders() {
        let expanded = expand_env_vars("agent ${AF_SURELY_NOT_SET_42}");
        assert_eq!(expanded, "agent ${AF_SURELY_NOT_SET_42}");
    }

    #[test]
    fn unset_variable_uses_fallback() {
        let expanded = expand_env_vars("a=${AF_SURELY_NOT_SET_43:-30} b=${AF_SURELY_NOT_SET_44:-}");
        assert_eq!(expanded, "a=30 b=");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(expand_env_vars("x ${OPEN and more"), "x ${OPEN and more");
        assert_eq!(expand_env_vars("cost: $5 {not}"), "cost: $5 {not}");
    }

    #[test]
    fn config_rejects_invalid_execution_mode() {
        let toml = r#"
            [sandbox]
            execution_mode = "wasm"
        "#;

        let err = AfConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("wasm"), "error should mention the mode: {msg}");
        assert!(
            msg.contains("in_process"),
            "error should mention supported modes: {msg}"
        );
    }

    #[test]
    fn config_rejects_zero_limits() {
        let err = AfConfig::from_toml("[sandbox]\nmax_storage_value_kb = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_storage_value_kb"));

        let err = AfConfig::from_toml("[transport]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn config_rejects_malformed_toml() {
        let err = AfConfig::from_toml("[sandbox\nexecution_mode = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("af.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            execution_mode = "in_process"
        "#,
        )
        .unwrap();

        let config = AfConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.execution_mode.as_deref(), Some("in_process"));
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AfConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
