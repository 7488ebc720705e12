//! Tool proxy collection: one outbound client per reachable connection.
//!
//! Construction runs in parallel and independently. A connection whose
//! client cannot be built is logged and left out; partial success is the
//! normal state of a collection, not an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use codemux_config::InvokerOverrides;
use futures::future::{join_all, try_join_all};
use futures::Future;

use crate::access::{ToolMetadata, ToolMetadataSource};
use crate::timeout::TimeoutClient;
use crate::{Connection, ToolClient};

/// Default bound on building one client, including tool discovery.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on one tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds outbound clients.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    /// Open a client for `connection` on behalf of the virtual node `node_id`.
    async fn connect(
        &self,
        connection: &Connection,
        node_id: &str,
    ) -> anyhow::Result<Arc<dyn ToolClient>>;
}

/// Everything collection construction needs besides the connections.
#[derive(Clone)]
pub struct ProxyContext {
    /// The virtual node the collection is built for.
    pub node_id: String,
    /// Client factory.
    pub factory: Arc<dyn ClientFactory>,
    /// Bound on building one client.
    pub connect_timeout: Duration,
    /// Bound on each tool call through a built client.
    pub call_timeout: Duration,
}

impl ProxyContext {
    /// A context with default timeouts.
    pub fn new(node_id: impl Into<String>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            node_id: node_id.into(),
            factory,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Apply the `[invoker]` timeouts.
    pub fn with_overrides(mut self, overrides: &InvokerOverrides) -> Self {
        if let Some(secs) = overrides.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.call_timeout_secs {
            self.call_timeout = Duration::from_secs(secs);
        }
        self
    }
}

/// A built client plus what is selected on its connection.
#[derive(Clone)]
pub struct ProxyEntry {
    /// The connection.
    pub connection: Connection,
    /// The client, bounded by the call timeout.
    pub client: Arc<dyn ToolClient>,
    /// Tools reachable through this entry.
    pub selected_tools: Vec<String>,
    /// Selected resources.
    pub selected_resources: Vec<String>,
    /// Selected prompts.
    pub selected_prompts: Vec<String>,
}

impl ProxyEntry {
    /// Whether `tool` is selected.
    pub fn selects_tool(&self, tool: &str) -> bool {
        self.selected_tools.iter().any(|t| t == tool)
    }

    /// Whether `tool` is listed in the connection's configured `public_tools`.
    /// The configured list overrides what the downstream declares.
    pub fn is_public(&self, tool: &str) -> bool {
        self.connection.public_tools.iter().any(|t| t == tool)
    }
}

impl std::fmt::Debug for ProxyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEntry")
            .field("connection", &self.connection.id)
            .field("selected_tools", &self.selected_tools)
            .finish_non_exhaustive()
    }
}

/// The clients reachable from one virtual node, keyed by connection id.
#[derive(Debug, Default)]
pub struct ProxyCollection {
    entries: HashMap<String, ProxyEntry>,
}

impl ProxyCollection {
    /// Build a client for every connection, in parallel. Failures are logged
    /// and the connection is omitted.
    pub async fn create(connections: Vec<Connection>, ctx: &ProxyContext) -> Self {
        let attempted = connections.len();
        let results = join_all(connections.into_iter().map(|c| build_entry(c, ctx))).await;

        let mut entries = HashMap::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(entry) => {
                    tracing::debug!(
                        connection = %id,
                        tools = entry.selected_tools.len(),
                        "proxy entry ready"
                    );
                    entries.insert(id, entry);
                }
                Err(e) => {
                    tracing::warn!(
                        node = %ctx.node_id,
                        connection = %id,
                        error = %e,
                        "skipping connection: client construction failed"
                    );
                }
            }
        }

        tracing::info!(
            node = %ctx.node_id,
            attempted,
            ready = entries.len(),
            "proxy collection built"
        );
        Self { entries }
    }

    /// Build a collection from already constructed entries.
    pub fn from_entries(entries: impl IntoIterator<Item = ProxyEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.connection.id.clone(), e))
                .collect(),
        }
    }

    /// Entry for connection `id`.
    pub fn get(&self, id: &str) -> Option<&ProxyEntry> {
        self.entries.get(id)
    }

    /// Number of reachable connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connection is reachable.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ProxyEntry> {
        self.entries.values()
    }

    /// Connection ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Every selected `(connection, tool)` pair, sorted.
    pub fn known_tools(&self) -> Vec<(&str, &str)> {
        let mut known: Vec<(&str, &str)> = self
            .entries
            .values()
            .flat_map(|entry| {
                entry
                    .selected_tools
                    .iter()
                    .map(move |tool| (entry.connection.id.as_str(), tool.as_str()))
            })
            .collect();
        known.sort_unstable();
        known
    }

    /// Run `f` on every entry concurrently; the first failure fails the whole
    /// traversal.
    pub async fn map_async<'a, F, Fut, T, E>(&'a self, f: F) -> Result<Vec<T>, E>
    where
        F: Fn(&'a ProxyEntry) -> Fut,
        Fut: Future<Output = Result<T, E>> + 'a,
    {
        try_join_all(self.entries.values().map(f)).await
    }

    /// Run `f` on every entry concurrently and collect each outcome with its
    /// connection id.
    pub async fn map_settled<'a, F, Fut, T, E>(&'a self, f: F) -> Vec<(String, Result<T, E>)>
    where
        F: Fn(&'a ProxyEntry) -> Fut,
        Fut: Future<Output = Result<T, E>> + 'a,
    {
        let ids = self.entries.keys().cloned();
        let outcomes = join_all(self.entries.values().map(f)).await;
        ids.zip(outcomes).collect()
    }
}

#[async_trait::async_trait]
impl ToolMetadataSource for ProxyCollection {
    /// Configured public tools answer immediately. Anything else is looked
    /// up in the connection's live tool list on every call, so a tool that
    /// changes its `_meta` is seen on the next decision.
    async fn tool_metadata(&self, connection: &str, tool: &str) -> Option<ToolMetadata> {
        let entry = self.get(connection)?;
        if entry.is_public(tool) {
            return Some(ToolMetadata { public: true });
        }
        let tools = match entry.client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(
                    connection = %connection,
                    tool = %tool,
                    error = %e,
                    "tool metadata lookup failed"
                );
                return None;
            }
        };
        let listed = tools.iter().find(|t| t.name == tool)?;
        Some(ToolMetadata {
            public: listed.declares_public(),
        })
    }
}

async fn build_entry(
    connection: Connection,
    ctx: &ProxyContext,
) -> (String, anyhow::Result<ProxyEntry>) {
    let id = connection.id.clone();
    let built = tokio::time::timeout(ctx.connect_timeout, connect_and_select(connection, ctx))
        .await
        .unwrap_or_else(|_| {
            Err(anyhow::anyhow!(
                "timed out after {}ms",
                ctx.connect_timeout.as_millis()
            ))
        });
    (id, built)
}

async fn connect_and_select(
    connection: Connection,
    ctx: &ProxyContext,
) -> anyhow::Result<ProxyEntry> {
    let client = ctx.factory.connect(&connection, &ctx.node_id).await?;
    let client: Arc<dyn ToolClient> =
        Arc::new(TimeoutClient::new(client, ctx.call_timeout, &connection.id));

    let selected_tools = if connection.tools.is_empty() {
        client
            .list_tools()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect()
    } else {
        connection.tools.clone()
    };

    Ok(ProxyEntry {
        selected_resources: connection.resources.clone(),
        selected_prompts: connection.prompts.clone(),
        selected_tools,
        client,
        connection,
    })
}
