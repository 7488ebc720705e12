#![warn(missing_docs)]

//! Typed error types for codemux tool dispatch.
//!
//! Provides [`DispatchError`], the canonical error for every tool-call surface:
//! host tool handlers exposed to the sandbox, outbound connection clients, and
//! the access-controlled invoker in front of them.

use thiserror::Error;

/// Canonical error type for tool dispatch operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The requested connection is not part of the proxy collection.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// The requested tool is not selected on the specified connection.
    #[error("tool not found: '{tool}' on connection '{connection}'")]
    ToolNotFound {
        /// The connection that was queried.
        connection: String,
        /// The tool name that was not found.
        tool: String,
    },

    /// The call did not complete within its deadline.
    #[error("timeout after {timeout_ms}ms on connection '{connection}'")]
    Timeout {
        /// The connection that timed out.
        connection: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The caller is not authorized to invoke the tool.
    #[error("Authorization failed: {reason}")]
    Unauthorized {
        /// Why the access decision denied the call.
        reason: String,
    },

    /// The downstream server answered with an error.
    #[error("upstream error from '{connection}': {message}")]
    Upstream {
        /// The connection that returned the error.
        connection: String,
        /// The error message reported downstream.
        message: String,
    },

    /// The outbound request could not be delivered.
    #[error("transport error on connection '{connection}': {message}")]
    Transport {
        /// The connection whose transport failed.
        connection: String,
        /// The underlying transport failure.
        message: String,
    },

    /// Streaming pass-through was requested for a connection that cannot stream.
    #[error("connection '{connection}' does not support streaming calls: {reason}")]
    StreamingUnsupported {
        /// The connection that was asked to stream.
        connection: String,
        /// Why streaming is not available.
        reason: String,
    },

    /// A per-execution call budget was exhausted.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::StreamingUnsupported { .. } => "STREAMING_UNSUPPORTED",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    ///
    /// Authorization denials are never retryable: the decision is recomputed
    /// on the next call, but retrying the same call blindly must not happen.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Upstream { .. } => true,
            Self::Transport { .. } => true,
            Self::RateLimit(_) => false,
            Self::ConnectionNotFound(_) => false,
            Self::ToolNotFound { .. } => false,
            Self::Unauthorized { .. } => false,
            Self::StreamingUnsupported { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error object.
    ///
    /// Returns a JSON object with `error`, `code`, `message`, `retryable`, and
    /// optionally `suggested_fix` (fuzzy-matched against `known_tools`, given
    /// as `(connection, tool)` pairs, for not-found errors).
    pub fn to_structured_error(&self, known_tools: Option<&[(&str, &str)]>) -> serde_json::Value {
        let suggested_fix = match self {
            Self::ToolNotFound { connection, tool } => {
                known_tools.and_then(|tools| find_similar_tool(connection, tool, tools))
            }
            Self::ConnectionNotFound(name) => {
                known_tools.and_then(|tools| find_similar_connection(name, tools))
            }
            Self::Timeout { .. } => Some("Retry with a simpler operation".to_string()),
            Self::Transport { .. } => Some("Retry after a delay".to_string()),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }

    /// The display message followed by the structured error's suggested fix,
    /// if there is one. This is the text script code sees when a tool fails.
    pub fn describe(&self, known_tools: Option<&[(&str, &str)]>) -> String {
        match self.to_structured_error(known_tools)["suggested_fix"].as_str() {
            Some(fix) => format!("{self}. {fix}"),
            None => self.to_string(),
        }
    }
}

/// Find the closest matching tool name using Levenshtein distance.
///
/// Returns a suggestion string if a tool within edit distance 3 is found.
fn find_similar_tool(
    connection: &str,
    tool: &str,
    known_tools: &[(&str, &str)],
) -> Option<String> {
    let full_name = format!("{connection}__{tool}");
    let mut best: Option<(usize, String)> = None;

    for &(c, t) in known_tools {
        let dist = strsim::levenshtein(&full_name, &format!("{c}__{t}"));
        if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
            best = Some((dist, format!("Did you mean '{t}' on connection '{c}'?")));
        }

        if c == connection {
            let dist = strsim::levenshtein(tool, t);
            if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
                best = Some((dist, format!("Did you mean '{t}'?")));
            }
        }
    }

    best.map(|(_, suggestion)| suggestion)
}

/// Find the closest matching connection name using Levenshtein distance.
fn find_similar_connection(name: &str, known_tools: &[(&str, &str)]) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
    let mut best: Option<(usize, String)> = None;

    for &(c, _) in known_tools {
        if !seen.insert(c) {
            continue;
        }
        let dist = strsim::levenshtein(name, c);
        if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
            best = Some((dist, format!("Did you mean connection '{c}'?")));
        }
    }

    best.map(|(_, suggestion)| suggestion)
}

// DispatchError crosses thread boundaries (sandbox thread <-> caller runtime).
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<DispatchError>();
};
