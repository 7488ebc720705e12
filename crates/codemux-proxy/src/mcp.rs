//! MCP client for downstream connections, over stdio or streamable HTTP.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use codemux_error::DispatchError;
use rmcp::model::{CallToolRequestParams, CallToolResult, Content, RawContent, Tool};
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{ConfigureCommandExt, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tokio::process::Command;

use crate::collection::ClientFactory;
use crate::{Connection, ToolClient, ToolInfo, TransportConfig};

/// Binary content (images, audio) above this size is replaced by metadata.
const MAX_BINARY_CONTENT_SIZE: usize = 1_048_576; // 1 MB

/// Text content above this size is replaced by a preview.
const MAX_TEXT_CONTENT_SIZE: usize = 10_485_760; // 10 MB

/// Header name fragments never sent over plain HTTP.
const SENSITIVE_HEADER_PATTERNS: &[&str] = &[
    "authorization",
    "cookie",
    "token",
    "secret",
    "key",
    "credential",
    "password",
    "auth",
];

/// A live MCP session with one downstream connection.
pub struct McpClient {
    connection: String,
    service: RunningService<RoleClient, ()>,
}

impl McpClient {
    /// Connect using the connection's transport.
    pub async fn connect(connection: &Connection) -> anyhow::Result<Self> {
        match &connection.transport {
            TransportConfig::Stdio { command, args } => {
                Self::connect_stdio(&connection.id, command, args).await
            }
            TransportConfig::Http { url, headers } => {
                let mut headers = headers.clone();
                if let Some(token) = &connection.bearer_token {
                    headers
                        .entry("Authorization".into())
                        .or_insert_with(|| format!("Bearer {token}"));
                }
                Self::connect_http(&connection.id, url, headers).await
            }
        }
    }

    /// Spawn `command` and speak MCP over its stdin/stdout.
    pub async fn connect_stdio(
        connection: &str,
        command: &str,
        args: &[String],
    ) -> anyhow::Result<Self> {
        tracing::info!(
            connection = %connection,
            command = %command,
            args = ?args,
            "connecting to downstream (stdio)"
        );

        let transport = TokioChildProcess::new(Command::new(command).configure(|cmd| {
            cmd.args(args);
        }))
        .with_context(|| format!("failed to spawn '{command}' for connection '{connection}'"))?;

        let service: RunningService<RoleClient, ()> = ()
            .serve(transport)
            .await
            .with_context(|| format!("MCP handshake failed for connection '{connection}'"))?;

        Ok(Self {
            connection: connection.to_string(),
            service,
        })
    }

    /// Connect to a streamable HTTP endpoint.
    pub async fn connect_http(
        connection: &str,
        url: &str,
        mut headers: HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        tracing::info!(connection = %connection, url = %url, "connecting to downstream (HTTP)");
        strip_sensitive_headers(url, &mut headers);

        let mut header_map = HashMap::new();
        for (key, value) in &headers {
            let name = http::HeaderName::from_bytes(key.as_bytes())
                .with_context(|| format!("invalid header name: {key}"))?;
            let value = http::HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for {key}"))?;
            header_map.insert(name, value);
        }

        let mut config = StreamableHttpClientTransportConfig::with_uri(url);
        if !header_map.is_empty() {
            config = config.custom_headers(header_map);
        }

        let service: RunningService<RoleClient, ()> = ()
            .serve(StreamableHttpClientTransport::from_config(config))
            .await
            .with_context(|| format!("MCP handshake failed for connection '{connection}'"))?;

        Ok(Self {
            connection: connection.to_string(),
            service,
        })
    }

    /// The connection id this client serves.
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Close the session.
    pub async fn disconnect(self) {
        tracing::info!(connection = %self.connection, "disconnecting from downstream");
        if let Err(e) = self.service.cancel().await {
            tracing::debug!(connection = %self.connection, error = %e, "disconnect failed");
        }
    }

    fn transport_error(&self, err: impl std::fmt::Display) -> DispatchError {
        DispatchError::Transport {
            connection: self.connection.clone(),
            message: err.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ToolClient for McpClient {
    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, DispatchError> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => Some(serde_json::Map::new()),
            other => {
                return Err(DispatchError::Upstream {
                    connection: self.connection.clone(),
                    message: format!("tool arguments must be an object, got {other}"),
                })
            }
        };

        tracing::debug!(connection = %self.connection, tool = %tool, "calling downstream tool");
        let result = self
            .service
            .call_tool(CallToolRequestParams {
                meta: None,
                name: Cow::Owned(tool.to_string()),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| self.transport_error(e))?;

        result_to_value(result).map_err(|message| DispatchError::Upstream {
            connection: self.connection.clone(),
            message,
        })
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, DispatchError> {
        let tools = self
            .service
            .list_all_tools()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(tools.into_iter().map(tool_info).collect())
    }
}

/// [`ClientFactory`] that opens an [`McpClient`] per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct McpClientFactory;

#[async_trait::async_trait]
impl ClientFactory for McpClientFactory {
    async fn connect(
        &self,
        connection: &Connection,
        node_id: &str,
    ) -> anyhow::Result<Arc<dyn ToolClient>> {
        tracing::debug!(node = %node_id, connection = %connection.id, "opening MCP client");
        Ok(Arc::new(McpClient::connect(connection).await?))
    }
}

/// Keep what the proxy needs from a listed tool, `_meta` included.
fn tool_info(tool: Tool) -> ToolInfo {
    let meta = serde_json::to_value(&tool)
        .ok()
        .and_then(|mut raw| raw.get_mut("_meta").map(Value::take))
        .unwrap_or(Value::Null);
    ToolInfo {
        name: tool.name.to_string(),
        description: tool.description.map(|d| d.to_string()),
        input_schema: serde_json::to_value(&*tool.input_schema)
            .unwrap_or_else(|_| Value::Object(Default::default())),
        meta,
    }
}

/// Convert a tool result to JSON. `Err` carries the tool's own error text.
fn result_to_value(result: CallToolResult) -> Result<Value, String> {
    if result.is_error == Some(true) {
        let text = result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Err(if text.is_empty() {
            "tool reported an error".into()
        } else {
            text
        });
    }
    if let Some(structured) = result.structured_content {
        return Ok(structured);
    }
    Ok(match result.content.as_slice() {
        [] => Value::Null,
        [single] => content_to_value(single),
        many => Value::Array(many.iter().map(content_to_value).collect()),
    })
}

fn content_to_value(content: &Content) -> Value {
    match &content.raw {
        RawContent::Text(t) if t.text.len() > MAX_TEXT_CONTENT_SIZE => {
            let mut end = 1024.min(t.text.len());
            while !t.text.is_char_boundary(end) {
                end -= 1;
            }
            serde_json::json!({
                "type": "text",
                "truncated": true,
                "original_size": t.text.len(),
                "preview": &t.text[..end],
            })
        }
        RawContent::Text(t) => {
            serde_json::from_str(&t.text).unwrap_or_else(|_| Value::String(t.text.clone()))
        }
        RawContent::Image(img) => binary("image", &img.data, &img.mime_type),
        RawContent::Audio(audio) => binary("audio", &audio.data, &audio.mime_type),
        RawContent::Resource(r) => serde_json::json!({
            "type": "resource",
            "resource": serde_json::to_value(&r.resource).unwrap_or(Value::Null),
        }),
        _ => serde_json::json!({"type": "unknown"}),
    }
}

fn binary(kind: &str, data: &str, mime_type: &str) -> Value {
    if data.len() > MAX_BINARY_CONTENT_SIZE {
        serde_json::json!({
            "type": kind,
            "truncated": true,
            "original_size": data.len(),
            "mime_type": mime_type,
        })
    } else {
        serde_json::json!({"type": kind, "data": data, "mime_type": mime_type})
    }
}

fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    SENSITIVE_HEADER_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Credentials only travel over TLS: drop sensitive headers for `http://` URLs.
fn strip_sensitive_headers(url: &str, headers: &mut HashMap<String, String>) {
    if !url.starts_with("http://") {
        return;
    }
    let mut removed: Vec<String> = Vec::new();
    headers.retain(|name, _| {
        let keep = !is_sensitive_header(name);
        if !keep {
            removed.push(name.clone());
        }
        keep
    });
    if !removed.is_empty() {
        tracing::warn!(
            url = %url,
            removed_headers = ?removed,
            "stripped sensitive headers from plain HTTP MCP connection"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listed_tool_keeps_its_meta() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "status",
            "description": "Service status",
            "inputSchema": {"type": "object"},
            "_meta": {"public": true}
        }))
        .unwrap();
        let info = tool_info(tool);
        assert_eq!(info.name, "status");
        assert_eq!(info.input_schema, json!({"type": "object"}));
        assert!(info.declares_public());

        let plain: Tool = serde_json::from_value(json!({
            "name": "search",
            "inputSchema": {"type": "object"}
        }))
        .unwrap();
        let info = tool_info(plain);
        assert_eq!(info.meta, Value::Null);
        assert!(!info.declares_public());
    }

    #[test]
    fn json_text_is_parsed() {
        assert_eq!(content_to_value(&Content::text(r#"{"k":"v"}"#)), json!({"k": "v"}));
        assert_eq!(content_to_value(&Content::text("plain")), json!("plain"));
    }

    #[test]
    fn large_image_is_summarized() {
        let content = Content::image("a".repeat(2 * MAX_BINARY_CONTENT_SIZE), "image/png");
        let value = content_to_value(&content);
        assert_eq!(value["truncated"], true);
        assert!(value.get("data").is_none());
    }

    #[test]
    fn error_results_carry_their_text() {
        let result = CallToolResult::error(vec![Content::text("bad input")]);
        assert_eq!(result_to_value(result), Err("bad input".to_string()));
    }

    #[test]
    fn multiple_contents_become_an_array() {
        let result = CallToolResult::success(vec![Content::text("1"), Content::text("two")]);
        assert_eq!(result_to_value(result), Ok(json!([1, "two"])));
    }

    #[test]
    fn plain_http_drops_credentials() {
        let mut headers = HashMap::from([
            ("Authorization".to_string(), "Bearer t".to_string()),
            ("X-Api-Key".to_string(), "k".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ]);
        strip_sensitive_headers("http://internal/mcp", &mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("Accept"));
    }

    #[test]
    fn https_keeps_credentials() {
        let mut headers = HashMap::from([("Authorization".to_string(), "Bearer t".to_string())]);
        strip_sensitive_headers("https://internal/mcp", &mut headers);
        assert!(headers.contains_key("Authorization"));
    }
}
