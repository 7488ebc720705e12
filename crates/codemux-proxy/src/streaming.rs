//! HTTP pass-through pieces of the streaming call path.

use anyhow::Context;
use bytes::Bytes;
use codemux_error::DispatchError;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::StatusCode;
use serde_json::Value;
use url::Url;

use crate::{Connection, TransportConfig};

/// Argument key holding the caller's cancellation signal. It has no meaning
/// across processes and is never forwarded.
pub const SIGNAL_ARGUMENT: &str = "signal";

/// Response body of a streaming call.
pub enum StreamingBody {
    /// A body produced locally, such as an authorization denial.
    Buffered(Bytes),
    /// The downstream response, not yet read.
    Upstream(reqwest::Response),
}

impl std::fmt::Debug for StreamingBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Upstream(_) => f.write_str("Upstream"),
        }
    }
}

/// The raw response of a streaming call, handed back to the caller as-is.
///
/// Redirects are not followed; a 3xx from the downstream arrives here.
#[derive(Debug)]
pub struct StreamingResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: StreamingBody,
    connection: String,
}

impl StreamingResponse {
    /// The 403 returned when the access policy denies a call.
    pub fn forbidden(connection: impl Into<String>, reason: &str) -> Self {
        let body = serde_json::json!({ "error": format!("Authorization failed: {reason}") });
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status: StatusCode::FORBIDDEN,
            headers,
            body: StreamingBody::Buffered(Bytes::from(body.to_string())),
            connection: connection.into(),
        }
    }

    pub(crate) fn upstream(connection: impl Into<String>, response: reqwest::Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
            body: StreamingBody::Upstream(response),
            connection: connection.into(),
        }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The body as a stream of chunks.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, DispatchError>> {
        match self.body {
            StreamingBody::Buffered(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            StreamingBody::Upstream(response) => {
                let connection = self.connection;
                response
                    .bytes_stream()
                    .map_err(move |e| DispatchError::Transport {
                        connection: connection.clone(),
                        message: e.to_string(),
                    })
                    .boxed()
            }
        }
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes, DispatchError> {
        match self.body {
            StreamingBody::Buffered(bytes) => Ok(bytes),
            StreamingBody::Upstream(response) => {
                response
                    .bytes()
                    .await
                    .map_err(|e| DispatchError::Transport {
                        connection: self.connection,
                        message: e.to_string(),
                    })
            }
        }
    }

    /// Read the whole body as JSON.
    pub async fn json(self) -> Result<Value, DispatchError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DispatchError::Internal(anyhow::anyhow!("response is not JSON: {e}")))
    }
}

/// `<base>/call-tool/<tool>`, with the tool name percent-encoded as one
/// path segment.
pub fn call_tool_url(base: &str, tool: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid base URL '{base}'"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow::anyhow!("base URL '{base}' cannot carry a path"))?
        .pop_if_empty()
        .push("call-tool")
        .push(tool);
    Ok(url)
}

/// Auth headers, then the static custom headers (which win on conflict),
/// then `Content-Type: application/json`.
pub fn outbound_headers(connection: &Connection) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(token) = &connection.bearer_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("bearer token is not a valid header value")?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    if let TransportConfig::Http { headers: custom, .. } = &connection.transport {
        for (name, value) in custom {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name: {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for {name}"))?;
            headers.insert(name, value);
        }
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Arguments as sent downstream: `null` becomes `{}` and the cancellation
/// signal is dropped.
pub fn sanitize_arguments(args: Value) -> Value {
    match args {
        Value::Null => Value::Object(Default::default()),
        Value::Object(mut map) => {
            map.remove(SIGNAL_ARGUMENT);
            Value::Object(map)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn url_appends_call_tool_segment() {
        let url = call_tool_url("https://api.example.com/mcp", "search").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/mcp/call-tool/search");

        let url = call_tool_url("https://api.example.com/mcp/", "search").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/mcp/call-tool/search");
    }

    #[test]
    fn url_encodes_tool_name() {
        let url = call_tool_url("https://api.example.com", "a/b c").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/call-tool/a%2Fb%20c");
    }

    #[test]
    fn url_rejects_garbage() {
        assert!(call_tool_url("not a url", "t").is_err());
    }

    #[test]
    fn custom_headers_override_auth_and_content_type_is_forced() {
        let mut connection = Connection::http("docs", "https://d");
        connection.bearer_token = Some("tok".into());
        connection.transport = TransportConfig::Http {
            url: "https://d".into(),
            headers: HashMap::from([
                ("X-Team".to_string(), "core".to_string()),
                ("Content-Type".to_string(), "text/plain".to_string()),
            ]),
        };
        let headers = outbound_headers(&connection).unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
        assert_eq!(headers["x-team"], "core");
        assert_eq!(headers[CONTENT_TYPE], "application/json");

        connection.transport = TransportConfig::Http {
            url: "https://d".into(),
            headers: HashMap::from([("Authorization".to_string(), "Basic xyz".to_string())]),
        };
        let headers = outbound_headers(&connection).unwrap();
        assert_eq!(headers[AUTHORIZATION], "Basic xyz");
    }

    #[test]
    fn sanitizer_drops_signal_and_fills_null() {
        assert_eq!(sanitize_arguments(Value::Null), json!({}));
        assert_eq!(
            sanitize_arguments(json!({"q": "rust", "signal": {}})),
            json!({"q": "rust"})
        );
        assert_eq!(sanitize_arguments(json!([1, 2])), json!([1, 2]));
    }

    #[tokio::test]
    async fn forbidden_response_carries_reason() {
        let response = StreamingResponse::forbidden("docs", "no grant");
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(
            response.json().await.unwrap(),
            json!({"error": "Authorization failed: no grant"})
        );
    }
}
