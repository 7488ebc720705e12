//! Error types for the codemux sandbox.

use thiserror::Error;

/// Errors that can occur while preparing or running one execution.
///
/// [`crate::SandboxExecutor::run_code`] never returns these directly; they are
/// folded into the `error` string of an [`crate::ExecutionResult`].
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The module source failed to parse, link or evaluate.
    #[error("{message}")]
    Compile {
        /// The engine's description of the failure.
        message: String,
    },

    /// The module's default export is not callable.
    #[error("TypeError: Code must export default a function (got {found}). Example: export default async (tools) => {{ ... }}")]
    InvalidExport {
        /// The `typeof` of the default export.
        found: String,
    },

    /// A JavaScript exception escaped user code.
    #[error("{message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
    },

    /// The interrupt deadline fired or the async pump ran out of time.
    #[error("execution timeout: exceeded {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("execution aborted: memory limit of {limit_bytes} bytes exceeded")]
    HeapLimitExceeded {
        /// The heap cap of the runtime.
        limit_bytes: usize,
    },

    /// The returned value is too large to copy out of the VM.
    #[error("output limit exceeded: returned value is larger than {limit} {unit}")]
    OutputLimit {
        /// The budget that was exceeded.
        limit: usize,
        /// `"items"` or `"bytes"`.
        unit: &'static str,
    },

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// Runtime limits that conflict with the process-wide engine settings.
    #[error("invalid runtime limits: {0}")]
    InvalidLimits(String),

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Host-side value serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Short, stable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CodeTooLarge { .. } => "code_too_large",
            Self::Compile { .. } => "compile",
            Self::InvalidExport { .. } => "invalid_export",
            Self::JsError { .. } => "js_error",
            Self::Timeout { .. } => "timeout",
            Self::HeapLimitExceeded { .. } => "heap_limit",
            Self::OutputLimit { .. } => "output_limit",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::InvalidLimits(_) => "invalid_limits",
            Self::Execution(_) => "execution",
            Self::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_export_message_shows_example_signature() {
        let err = SandboxError::InvalidExport {
            found: "number".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Code must export default a function"));
        assert!(msg.contains("export default async (tools) => { ... }"));
        assert!(msg.contains("number"));
    }

    #[test]
    fn timeout_mentions_timeout() {
        let err = SandboxError::Timeout { timeout_ms: 50 };
        assert_eq!(err.to_string(), "execution timeout: exceeded 50ms");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn js_error_is_passed_through_verbatim() {
        let err = SandboxError::JsError {
            message: "Uncaught Error: boom".into(),
        };
        assert_eq!(err.to_string(), "Uncaught Error: boom");
    }
}
