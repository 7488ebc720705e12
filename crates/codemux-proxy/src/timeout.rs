//! Per-connection timeout wrapper for tool clients.

use std::sync::Arc;
use std::time::Duration;

use codemux_error::DispatchError;
use serde_json::Value;

use crate::{ToolClient, ToolInfo};

/// A [`ToolClient`] that bounds every call on the inner client.
pub struct TimeoutClient {
    inner: Arc<dyn ToolClient>,
    timeout: Duration,
    connection: String,
}

impl TimeoutClient {
    /// Wrap `inner` with a per-call timeout.
    pub fn new(inner: Arc<dyn ToolClient>, timeout: Duration, connection: impl Into<String>) -> Self {
        Self {
            inner,
            timeout,
            connection: connection.into(),
        }
    }

    fn elapsed(&self) -> DispatchError {
        DispatchError::Timeout {
            connection: self.connection.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

#[async_trait::async_trait]
impl ToolClient for TimeoutClient {
    #[tracing::instrument(skip(self, args), fields(connection = %self.connection))]
    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, DispatchError> {
        tokio::time::timeout(self.timeout, self.inner.call_tool(tool, args))
            .await
            .map_err(|_| self.elapsed())?
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, DispatchError> {
        tokio::time::timeout(self.timeout, self.inner.list_tools())
            .await
            .map_err(|_| self.elapsed())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClient {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ToolClient for SlowClient {
        async fn call_tool(&self, tool: &str, _args: Value) -> Result<Value, DispatchError> {
            tokio::time::sleep(self.delay).await;
            Ok(serde_json::json!({ "tool": tool }))
        }

        async fn list_tools(&self) -> Result<Vec<ToolInfo>, DispatchError> {
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }
    }

    struct BrokenClient;

    #[async_trait::async_trait]
    impl ToolClient for BrokenClient {
        async fn call_tool(&self, _tool: &str, _args: Value) -> Result<Value, DispatchError> {
            Err(DispatchError::Internal(anyhow::anyhow!("inner error")))
        }

        async fn list_tools(&self) -> Result<Vec<ToolInfo>, DispatchError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let client = TimeoutClient::new(
            Arc::new(SlowClient {
                delay: Duration::ZERO,
            }),
            Duration::from_secs(5),
            "docs",
        );
        let value = client.call_tool("search", serde_json::json!({})).await.unwrap();
        assert_eq!(value["tool"], "search");
    }

    #[tokio::test]
    async fn slow_call_times_out_with_connection_context() {
        let client = TimeoutClient::new(
            Arc::new(SlowClient {
                delay: Duration::from_secs(10),
            }),
            Duration::from_millis(50),
            "docs",
        );
        let err = client
            .call_tool("search", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { ref connection, timeout_ms: 50 } if connection == "docs"));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn slow_listing_times_out() {
        let client = TimeoutClient::new(
            Arc::new(SlowClient {
                delay: Duration::from_secs(10),
            }),
            Duration::from_millis(20),
            "docs",
        );
        assert!(matches!(
            client.list_tools().await,
            Err(DispatchError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn inner_error_is_preserved() {
        let client = TimeoutClient::new(Arc::new(BrokenClient), Duration::from_secs(1), "docs");
        let err = client.call_tool("x", Value::Null).await.unwrap_err();
        assert!(matches!(err, DispatchError::Internal(_)));
    }
}
