//! Shared fixtures for codemux-proxy integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use codemux_error::DispatchError;
use codemux_proxy::{ClientFactory, Connection, ToolClient, ToolInfo};
use serde_json::{json, Value};

/// Answers every call with `{connection, tool, args}`.
pub struct EchoClient {
    pub connection: String,
    pub tools: Vec<String>,
    /// Tools listed with `_meta: {"public": true}`.
    pub declared_public: Vec<String>,
    pub calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ToolClient for EchoClient {
    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"connection": self.connection, "tool": tool, "args": args}))
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, DispatchError> {
        Ok(self
            .tools
            .iter()
            .map(|name| ToolInfo {
                name: name.clone(),
                description: None,
                input_schema: json!({"type": "object"}),
                meta: if self.declared_public.contains(name) {
                    json!({"public": true})
                } else {
                    Value::Null
                },
            })
            .collect())
    }
}

/// Builds [`EchoClient`]s, failing for the listed connection ids.
#[derive(Default)]
pub struct FlakyFactory {
    pub failing: HashSet<String>,
    pub declared_public: Vec<String>,
    pub attempts: AtomicUsize,
}

impl FlakyFactory {
    pub fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Every client lists `tools` as declaring themselves public.
    pub fn declaring_public(tools: &[&str]) -> Self {
        Self {
            declared_public: tools.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl ClientFactory for FlakyFactory {
    async fn connect(
        &self,
        connection: &Connection,
        _node_id: &str,
    ) -> anyhow::Result<Arc<dyn ToolClient>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&connection.id) {
            anyhow::bail!("connection refused");
        }
        Ok(Arc::new(EchoClient {
            connection: connection.id.clone(),
            tools: vec!["search".into(), "fetch".into()],
            declared_public: self.declared_public.clone(),
            calls: AtomicUsize::new(0),
        }))
    }
}
