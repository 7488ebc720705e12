//! Per-call access decisions.
//!
//! A decision is computed fresh for every `(caller, tool, connection)` triple
//! and never cached: grants and the public-tool flag may change between calls.

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Who is making a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerIdentity {
    /// No authenticated identity.
    Anonymous,
    /// An authenticated principal.
    Principal(String),
}

impl CallerIdentity {
    /// An authenticated principal.
    pub fn principal(id: impl Into<String>) -> Self {
        Self::Principal(id.into())
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::Principal(id) => f.write_str(id),
        }
    }
}

/// The triple an [`AccessDecision`] is made for.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    /// The caller.
    pub caller: &'a CallerIdentity,
    /// The tool being called.
    pub tool: &'a str,
    /// The connection that serves the tool.
    pub connection: &'a str,
}

/// Outcome of one authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// The call may proceed.
    Allow,
    /// The call is refused.
    Deny {
        /// Human-readable reason.
        reason: String,
    },
}

impl AccessDecision {
    /// A denial with `reason`.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Per-tool metadata relevant to authorization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolMetadata {
    /// Callable without an authenticated identity.
    pub public: bool,
}

/// Looks up tool metadata on demand. Tool lists are connection-specific and
/// not known upfront, so policies ask for metadata only when they need it.
#[async_trait::async_trait]
pub trait ToolMetadataSource: Send + Sync {
    /// Metadata for `tool` on `connection`, `None` when unknown.
    async fn tool_metadata(&self, connection: &str, tool: &str) -> Option<ToolMetadata>;
}

/// Decides whether a call may proceed.
#[async_trait::async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Evaluate `request`, fetching metadata from `metadata` if needed.
    async fn decide(
        &self,
        request: &AccessRequest<'_>,
        metadata: &dyn ToolMetadataSource,
    ) -> AccessDecision;
}

/// Grants connections to principals; public tools are open to everyone.
///
/// A grant of `*` covers every connection.
#[derive(Debug, Clone, Default)]
pub struct GrantPolicy {
    grants: HashMap<String, HashSet<String>>,
}

impl GrantPolicy {
    /// Wildcard connection grant.
    pub const ALL_CONNECTIONS: &'static str = "*";

    /// An empty policy: only public tools are reachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `principal` access to `connection` (or [`Self::ALL_CONNECTIONS`]).
    pub fn grant(mut self, principal: impl Into<String>, connection: impl Into<String>) -> Self {
        self.grants
            .entry(principal.into())
            .or_default()
            .insert(connection.into());
        self
    }

    fn granted(&self, principal: &str, connection: &str) -> bool {
        self.grants.get(principal).is_some_and(|connections| {
            connections.contains(Self::ALL_CONNECTIONS) || connections.contains(connection)
        })
    }
}

#[async_trait::async_trait]
impl AccessPolicy for GrantPolicy {
    async fn decide(
        &self,
        request: &AccessRequest<'_>,
        metadata: &dyn ToolMetadataSource,
    ) -> AccessDecision {
        if let CallerIdentity::Principal(principal) = request.caller {
            if self.granted(principal, request.connection) {
                return AccessDecision::Allow;
            }
        }

        let public = metadata
            .tool_metadata(request.connection, request.tool)
            .await
            .is_some_and(|m| m.public);
        if public {
            return AccessDecision::Allow;
        }

        match request.caller {
            CallerIdentity::Anonymous => AccessDecision::deny(format!(
                "tool '{}' on connection '{}' requires an authenticated caller",
                request.tool, request.connection
            )),
            CallerIdentity::Principal(principal) => AccessDecision::deny(format!(
                "'{principal}' has no access to connection '{}'",
                request.connection
            )),
        }
    }
}
