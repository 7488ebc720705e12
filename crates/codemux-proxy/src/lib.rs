#![warn(missing_docs)]

//! # codemux-proxy
//!
//! Outbound tool clients for a codemux virtual node and the access-controlled
//! bridge that exposes them to sandboxed scripts.
//!
//! [`ProxyCollection`] builds one client per reachable downstream connection,
//! tolerating individual failures. [`AccessControlledInvoker`] authorizes
//! every call against an [`AccessPolicy`] before delegating, either as an
//! ordinary tool call or as a raw HTTP pass-through, and assembles the
//! `tools` mapping handed to `run_code`.

pub mod access;
pub mod collection;
pub mod invoker;
pub mod mcp;
pub mod metrics;
pub mod streaming;
pub mod timeout;

use std::collections::HashMap;

use codemux_config::{CodemuxConfig, ConfigError, ConnectionConfig};
use codemux_error::DispatchError;
use serde_json::Value;

pub use access::{
    AccessDecision, AccessPolicy, AccessRequest, CallerIdentity, GrantPolicy, ToolMetadata,
    ToolMetadataSource,
};
pub use collection::{ClientFactory, ProxyCollection, ProxyContext, ProxyEntry};
pub use invoker::{AccessControlledInvoker, TOOL_NAME_SEPARATOR};
pub use mcp::{McpClient, McpClientFactory};
pub use metrics::InvokerMetrics;
pub use streaming::{StreamingBody, StreamingResponse};
pub use timeout::TimeoutClient;

/// An outbound client for one downstream connection.
#[async_trait::async_trait]
pub trait ToolClient: Send + Sync {
    /// Call `tool` with `args` and return its JSON result.
    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, DispatchError>;

    /// List the tools the downstream server exposes.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, DispatchError>;
}

/// Key in a tool's `_meta` object that declares the tool public.
pub const PUBLIC_META_KEY: &str = "public";

/// Information about a tool discovered from a downstream server.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
    /// The tool's `_meta` object as declared downstream, `Null` when absent.
    pub meta: Value,
}

impl ToolInfo {
    /// Whether the tool declares itself public (`_meta.public == true`).
    pub fn declares_public(&self) -> bool {
        self.meta
            .get(PUBLIC_META_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// How to reach a downstream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    /// Connect via stdio to a child process.
    Stdio {
        /// Command to execute.
        command: String,
        /// Arguments to the command.
        args: Vec<String>,
    },
    /// Connect over HTTP.
    Http {
        /// Base URL of the downstream server.
        url: String,
        /// Static custom headers.
        headers: HashMap<String, String>,
    },
}

/// A configured downstream connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Connection id; the key under which the collection indexes it.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Transport.
    pub transport: TransportConfig,
    /// Whether the connection is itself a virtual aggregation node.
    pub is_virtual: bool,
    /// Bearer token for the `Authorization` header.
    pub bearer_token: Option<String>,
    /// Selected tools; empty selects everything the server lists.
    pub tools: Vec<String>,
    /// Selected resources.
    pub resources: Vec<String>,
    /// Selected prompts.
    pub prompts: Vec<String>,
    /// Tools callable by anonymous callers.
    pub public_tools: Vec<String>,
}

impl Connection {
    /// An HTTP connection with nothing selected.
    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            transport: TransportConfig::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            is_virtual: false,
            bearer_token: None,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            public_tools: Vec::new(),
        }
    }

    /// A stdio connection with nothing selected.
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportConfig::Stdio {
                command: command.into(),
                args,
            },
            ..Self::http(id, String::new())
        }
    }

    /// Build a connection from its `[connections.<id>]` table.
    pub fn from_config(id: &str, config: &ConnectionConfig) -> Result<Self, ConfigError> {
        let transport = match config.transport.as_str() {
            "stdio" => TransportConfig::Stdio {
                command: config.command.clone().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "connection '{id}': stdio transport requires 'command'"
                    ))
                })?,
                args: config.args.clone(),
            },
            "http" => TransportConfig::Http {
                url: config.url.clone().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "connection '{id}': http transport requires 'url'"
                    ))
                })?,
                headers: config.headers.clone(),
            },
            other => {
                return Err(ConfigError::Invalid(format!(
                    "connection '{id}': unsupported transport '{other}'"
                )))
            }
        };
        Ok(Self {
            id: id.to_string(),
            name: config.name.clone().unwrap_or_else(|| id.to_string()),
            transport,
            is_virtual: config.is_virtual,
            bearer_token: config.bearer_token.clone(),
            tools: config.tools.clone(),
            resources: config.resources.clone(),
            prompts: config.prompts.clone(),
            public_tools: config.public_tools.clone(),
        })
    }

    /// Every connection in `config`, sorted by id.
    pub fn all_from_config(config: &CodemuxConfig) -> Result<Vec<Self>, ConfigError> {
        let mut connections = config
            .connections
            .iter()
            .map(|(id, conn)| Self::from_config(id, conn))
            .collect::<Result<Vec<_>, _>>()?;
        connections.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(connections)
    }

    /// Whether the connection can serve streaming pass-through calls.
    pub fn supports_streaming(&self) -> bool {
        matches!(self.transport, TransportConfig::Http { .. }) && !self.is_virtual
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connections_from_config() {
        let config = CodemuxConfig::from_toml(
            r#"
            [connections.search]
            transport = "http"
            url = "https://search.example.com/mcp"
            bearer_token = "tok"
            tools = ["query", "suggest"]
            public_tools = ["suggest"]

            [connections.fs]
            transport = "stdio"
            command = "fs-server"
            args = ["--root", "/data"]
            name = "Files"
            "#,
        )
        .unwrap();

        let connections = Connection::all_from_config(&config).unwrap();
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].id, "fs");
        assert_eq!(connections[0].name, "Files");
        assert!(matches!(
            connections[0].transport,
            TransportConfig::Stdio { ref command, .. } if command == "fs-server"
        ));
        assert_eq!(connections[1].name, "search");
        assert_eq!(connections[1].bearer_token.as_deref(), Some("tok"));
        assert_eq!(connections[1].public_tools, vec!["suggest"]);
    }

    #[test]
    fn streaming_requires_plain_http_connection() {
        let mut http = Connection::http("a", "https://a.example.com");
        assert!(http.supports_streaming());
        http.is_virtual = true;
        assert!(!http.supports_streaming());
        assert!(!Connection::stdio("b", "srv", vec![]).supports_streaming());
    }
}
