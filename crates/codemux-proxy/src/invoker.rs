//! Access-controlled invoker: the only path from a script to a downstream tool.
//!
//! Every attempt, on either path, is authorized first and recorded in the
//! invoker metrics. Authorization denials are never retried.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use codemux_error::DispatchError;
use codemux_sandbox::ToolHandler;
use serde_json::Value;

use crate::access::{AccessDecision, AccessPolicy, AccessRequest, CallerIdentity};
use crate::collection::{ProxyCollection, ProxyEntry};
use crate::metrics::InvokerMetrics;
use crate::streaming::{self, StreamingResponse};
use crate::TransportConfig;

/// Separator between connection id and tool name in script-visible names.
pub const TOOL_NAME_SEPARATOR: &str = "__";

/// Authorizes and delegates tool calls to a [`ProxyCollection`].
pub struct AccessControlledInvoker {
    collection: Arc<ProxyCollection>,
    policy: Arc<dyn AccessPolicy>,
    http: reqwest::Client,
    metrics: Option<Arc<InvokerMetrics>>,
}

impl AccessControlledInvoker {
    /// Create an invoker. The HTTP client used for streaming never follows
    /// redirects.
    pub fn new(
        collection: Arc<ProxyCollection>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<Self, DispatchError> {
        Self::with_connect_timeout(collection, policy, None)
    }

    /// Like [`Self::new`], bounding connection setup of streaming calls.
    pub fn with_connect_timeout(
        collection: Arc<ProxyCollection>,
        policy: Arc<dyn AccessPolicy>,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, DispatchError> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build().map_err(|e| {
            DispatchError::Internal(anyhow::anyhow!("HTTP client setup failed: {e}"))
        })?;
        Ok(Self {
            collection,
            policy,
            http,
            metrics: None,
        })
    }

    /// Record every attempt into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<InvokerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The collection this invoker delegates to.
    pub fn collection(&self) -> &Arc<ProxyCollection> {
        &self.collection
    }

    /// Authorize, check the tool is selected, then call it.
    #[tracing::instrument(skip(self, caller, args), fields(caller = %caller))]
    pub async fn call_tool(
        &self,
        caller: &CallerIdentity,
        connection: &str,
        tool: &str,
        args: Value,
    ) -> Result<Value, DispatchError> {
        let started = Instant::now();
        let result = self.call_tool_inner(caller, connection, tool, args).await;
        self.record(connection, tool, result.is_ok(), started);
        if let Err(e) = &result {
            tracing::debug!(code = e.code(), error = %self.describe(e), "tool call failed");
        }
        result
    }

    /// `err` as a structured JSON object, with "did you mean" suggestions
    /// drawn from the collection's selected tools.
    pub fn structured_error(&self, err: &DispatchError) -> Value {
        err.to_structured_error(Some(&self.collection.known_tools()))
    }

    /// `err` as text with the suggestion from [`Self::structured_error`].
    pub fn describe(&self, err: &DispatchError) -> String {
        err.describe(Some(&self.collection.known_tools()))
    }

    async fn call_tool_inner(
        &self,
        caller: &CallerIdentity,
        connection: &str,
        tool: &str,
        args: Value,
    ) -> Result<Value, DispatchError> {
        let entry = self.entry(connection)?;
        if let AccessDecision::Deny { reason } = self.authorize(caller, connection, tool).await {
            return Err(DispatchError::Unauthorized { reason });
        }
        if !entry.selects_tool(tool) {
            return Err(DispatchError::ToolNotFound {
                connection: connection.to_string(),
                tool: tool.to_string(),
            });
        }
        entry.client.call_tool(tool, args).await
    }

    /// Authorize, then pass the call through to the connection's HTTP
    /// endpoint and return the raw response.
    ///
    /// Only plain HTTP connections stream. A denial never reaches the
    /// network and comes back as a 403 response. Non-2xx responses are
    /// returned as they are and counted as errors.
    #[tracing::instrument(skip(self, caller, args), fields(caller = %caller))]
    pub async fn call_tool_streaming(
        &self,
        caller: &CallerIdentity,
        connection: &str,
        tool: &str,
        args: Value,
    ) -> Result<StreamingResponse, DispatchError> {
        let started = Instant::now();
        let result = self.stream_inner(caller, connection, tool, args).await;
        let success = matches!(&result, Ok(response) if response.is_success());
        self.record(connection, tool, success, started);
        result
    }

    async fn stream_inner(
        &self,
        caller: &CallerIdentity,
        connection: &str,
        tool: &str,
        args: Value,
    ) -> Result<StreamingResponse, DispatchError> {
        let entry = self.entry(connection)?;
        let base = match &entry.connection.transport {
            TransportConfig::Http { url, .. } if !entry.connection.is_virtual => url,
            _ => {
                return Err(DispatchError::StreamingUnsupported {
                    connection: connection.to_string(),
                    reason: "only non-virtual HTTP connections stream".into(),
                })
            }
        };

        if let AccessDecision::Deny { reason } = self.authorize(caller, connection, tool).await {
            tracing::info!(reason = %reason, "streaming call denied");
            return Ok(StreamingResponse::forbidden(connection, &reason));
        }

        let url = streaming::call_tool_url(base, tool)?;
        let headers = streaming::outbound_headers(&entry.connection)?;
        let body = serde_json::to_vec(&streaming::sanitize_arguments(args))
            .map_err(|e| DispatchError::Internal(e.into()))?;

        tracing::debug!(url = %url, "forwarding streaming call");
        let response = self
            .http
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| DispatchError::Transport {
                connection: connection.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "streaming call returned an error status");
        }
        Ok(StreamingResponse::upstream(connection, response))
    }

    /// Assemble the `tools` mapping for `run_code`: one handler per selected
    /// tool, named `<connection>__<tool>`, each calling through this invoker
    /// as `caller`.
    pub fn tool_handlers(
        self: &Arc<Self>,
        caller: &CallerIdentity,
    ) -> BTreeMap<String, Arc<dyn ToolHandler>> {
        let mut handlers: BTreeMap<String, Arc<dyn ToolHandler>> = BTreeMap::new();
        for entry in self.collection.iter() {
            for tool in &entry.selected_tools {
                let name = format!("{}{TOOL_NAME_SEPARATOR}{tool}", entry.connection.id);
                handlers.insert(
                    name,
                    Arc::new(InvokerToolHandler {
                        invoker: Arc::clone(self),
                        caller: caller.clone(),
                        connection: entry.connection.id.clone(),
                        tool: tool.clone(),
                    }),
                );
            }
        }
        handlers
    }

    fn entry(&self, connection: &str) -> Result<&ProxyEntry, DispatchError> {
        self.collection
            .get(connection)
            .ok_or_else(|| DispatchError::ConnectionNotFound(connection.to_string()))
    }

    async fn authorize(
        &self,
        caller: &CallerIdentity,
        connection: &str,
        tool: &str,
    ) -> AccessDecision {
        let request = AccessRequest {
            caller,
            tool,
            connection,
        };
        self.policy.decide(&request, self.collection.as_ref()).await
    }

    fn record(&self, connection: &str, tool: &str, success: bool, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_call(connection, tool, success, started.elapsed().as_secs_f64());
        }
    }
}

struct InvokerToolHandler {
    invoker: Arc<AccessControlledInvoker>,
    caller: CallerIdentity,
    connection: String,
    tool: String,
}

#[async_trait::async_trait]
impl ToolHandler for InvokerToolHandler {
    async fn call(&self, args: Value) -> Result<Value, DispatchError> {
        self.invoker
            .call_tool(&self.caller, &self.connection, &self.tool, args)
            .await
    }
}
