#![warn(missing_docs)]

//! # codemux-config
//!
//! Configuration loading for codemux virtual nodes.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [connections.files]
//! command = "files-mcp"
//! args = ["--root", "."]
//! transport = "stdio"
//!
//! [connections.search]
//! url = "https://search.internal/mcp"
//! transport = "http"
//! bearer_token = "${SEARCH_TOKEN}"
//! headers = { "X-Tenant" = "acme" }
//! tools = ["query", "suggest"]
//! public_tools = ["suggest"]
//!
//! [sandbox]
//! timeout_ms = 30000
//! max_concurrent = 8
//! max_host_calls = 50
//!
//! [invoker]
//! connect_timeout_secs = 10
//! call_timeout_secs = 60
//! ```

use std::collections::HashMap;
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

/// Top-level codemux configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodemuxConfig {
    /// Downstream connections reachable from this node, keyed by connection id.
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Tool invoker settings.
    #[serde(default)]
    pub invoker: InvokerOverrides,
}

/// Configuration for a single downstream connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Transport type: "stdio" or "http".
    pub transport: String,

    /// Display name; defaults to the connection id.
    #[serde(default)]
    pub name: Option<String>,

    /// Command to execute (stdio transport).
    #[serde(default)]
    pub command: Option<String>,

    /// Command arguments (stdio transport).
    #[serde(default)]
    pub args: Vec<String>,

    /// Base URL (http transport).
    #[serde(default)]
    pub url: Option<String>,

    /// Static custom headers sent on every request (http transport).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Bearer token used to build the `Authorization` header.
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Whether this connection is itself a virtual aggregation node.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,

    /// Selected tools. Empty means "everything the server lists".
    #[serde(default)]
    pub tools: Vec<String>,

    /// Selected resources.
    #[serde(default)]
    pub resources: Vec<String>,

    /// Selected prompts.
    #[serde(default)]
    pub prompts: Vec<String>,

    /// Tools callable without a caller identity.
    #[serde(default)]
    pub public_tools: Vec<String>,
}

/// Sandbox configuration overrides.
///
/// Memory and stack caps are intentionally absent: they are fixed per runtime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Default execution timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Maximum concurrent sandbox executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum script size in kilobytes.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Maximum host function calls per execution.
    #[serde(default)]
    pub max_host_calls: Option<usize>,
}

/// Invoker configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvokerOverrides {
    /// Timeout for constructing one outbound client, in seconds.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// Timeout for a single tool call, in seconds.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
}

impl CodemuxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: CodemuxConfig = toml::from_str(toml_str)?;
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
        for (id, conn) in &self.connections {
            match conn.transport.as_str() {
                "stdio" => {
                    if conn.command.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "connection '{id}': stdio transport requires 'command'"
                        )));
                    }
                }
                "http" => {
                    if conn.url.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "connection '{id}': http transport requires 'url'"
                        )));
                    }
                }
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "connection '{id}': unsupported transport '{other}', supported: stdio, http"
                    )));
                }
            }
            if let Some(tool) = conn
                .public_tools
                .iter()
                .find(|t| !conn.tools.is_empty() && !conn.tools.contains(t))
            {
                return Err(ConfigError::Invalid(format!(
                    "connection '{id}': public tool '{tool}' is not in the selected tools"
                )));
            }
        }
        if self.sandbox.max_concurrent == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent must be at least 1".into(),
            ));
        }
        if self.sandbox.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
///
/// Unresolved references are left in place.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var_name = &after[..end];
                match std::env::var(var_name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(var_name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stdio_connection() {
        let toml = r#"
            [connections.files]
            command = "files-mcp"
            transport = "stdio"
        "#;

        let config = CodemuxConfig::from_toml(toml).unwrap();
        assert_eq!(config.connections.len(), 1);
        let files = &config.connections["files"];
        assert_eq!(files.transport, "stdio");
        assert_eq!(files.command.as_deref(), Some("files-mcp"));
        assert!(!files.is_virtual);
    }

    #[test]
    fn parses_http_connection_with_selection() {
        let toml = r#"
            [connections.search]
            url = "https://search.internal/mcp"
            transport = "http"
            virtual = true
            bearer_token = "abc"
            tools = ["query", "suggest"]
            public_tools = ["suggest"]
            resources = ["index"]
        "#;

        let config = CodemuxConfig::from_toml(toml).unwrap();
        let search = &config.connections["search"];
        assert_eq!(search.url.as_deref(), Some("https://search.internal/mcp"));
        assert!(search.is_virtual);
        assert_eq!(search.bearer_token.as_deref(), Some("abc"));
        assert_eq!(search.tools, vec!["query", "suggest"]);
        assert_eq!(search.public_tools, vec!["suggest"]);
        assert_eq!(search.resources, vec!["index"]);
        assert!(search.prompts.is_empty());
    }

    #[test]
    fn parses_sandbox_and_invoker_overrides() {
        let toml = r#"
            [sandbox]
            timeout_ms = 1500
            max_concurrent = 4
            max_code_size_kb = 128
            max_host_calls = 20

            [invoker]
            connect_timeout_secs = 3
            call_timeout_secs = 9
        "#;

        let config = CodemuxConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(1500));
        assert_eq!(config.sandbox.max_concurrent, Some(4));
        assert_eq!(config.sandbox.max_code_size_kb, Some(128));
        assert_eq!(config.sandbox.max_host_calls, Some(20));
        assert_eq!(config.invoker.connect_timeout_secs, Some(3));
        assert_eq!(config.invoker.call_timeout_secs, Some(9));
    }

    #[test]
    fn memory_caps_are_not_accepted() {
        let toml = r#"
            [sandbox]
            max_heap_mb = 512
        "#;

        // Unknown keys are ignored, and nothing reaches the runtime caps.
        let config = CodemuxConfig::from_toml(toml).unwrap();
        assert!(config.sandbox.timeout_ms.is_none());
    }

    #[test]
    fn expands_environment_variables() {
        std::env::set_var("CODEMUX_TEST_TOKEN", "secret123");
        let toml = r#"
            [connections.search]
            url = "https://search.internal/mcp"
            transport = "http"
            bearer_token = "${CODEMUX_TEST_TOKEN}"
            headers = { "X-Key" = "k-${CODEMUX_TEST_TOKEN}" }
        "#;

        let config = CodemuxConfig::from_toml_with_env(toml).unwrap();
        let search = &config.connections["search"];
        assert_eq!(search.bearer_token.as_deref(), Some("secret123"));
        assert_eq!(search.headers.get("X-Key").unwrap(), "k-secret123");
        std::env::remove_var("CODEMUX_TEST_TOKEN");
    }

    #[test]
    fn rejects_invalid_transport() {
        let toml = r#"
            [connections.test]
            command = "test"
            transport = "grpc"
        "#;

        let msg = CodemuxConfig::from_toml(toml).unwrap_err().to_string();
        assert!(msg.contains("grpc"), "error should mention the transport: {msg}");
        assert!(msg.contains("stdio"), "error should mention supported transports: {msg}");
    }

    #[test]
    fn rejects_stdio_without_command() {
        let toml = r#"
            [connections.test]
            transport = "stdio"
        "#;

        let err = CodemuxConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn rejects_http_without_url() {
        let toml = r#"
            [connections.test]
            transport = "http"
        "#;

        let err = CodemuxConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn rejects_public_tool_outside_selection() {
        let toml = r#"
            [connections.test]
            transport = "http"
            url = "http://localhost:1"
            tools = ["a"]
            public_tools = ["b"]
        "#;

        let err = CodemuxConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = CodemuxConfig::from_toml("[sandbox]\nmax_concurrent = 0").unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn loads_from_file() {
        let dir = std::env::temp_dir().join("codemux-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("codemux.toml");
        std::fs::write(
            &path,
            r#"
            [connections.test]
            command = "test-server"
            transport = "stdio"
        "#,
        )
        .unwrap();

        let config = CodemuxConfig::from_file(&path).unwrap();
        assert_eq!(
            config.connections["test"].command.as_deref(),
            Some("test-server")
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_config_is_valid() {
        let config = CodemuxConfig::from_toml("").unwrap();
        assert!(config.connections.is_empty());
        assert!(config.sandbox.max_host_calls.is_none());
        assert!(config.invoker.call_timeout_secs.is_none());
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_keeps_unterminated_reference() {
        assert_eq!(expand_env_vars("a ${OPEN"), "a ${OPEN");
        assert_eq!(expand_env_vars("no variables here"), "no variables here");
    }
}
