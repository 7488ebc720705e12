#![warn(missing_docs)]

//! # codemux-sandbox
//!
//! Per-execution V8 sandbox for codemux virtual nodes.
//!
//! Runs one ES module of untrusted code in a fresh deno_core isolate whose
//! only bridge to the host is the set of tool handlers and globals injected
//! for that execution. The module's default export is called with the tools
//! object and its (awaited) result is returned with the console output the
//! script produced.
//!
//! ## Security model
//!
//! - **Fresh isolate per execution**: no state leaks between calls, and the
//!   runtime-scoped interrupt deadline never races another execution
//! - **Fixed caps**: 32 MiB heap and 512 KiB stack, not configurable
//! - **No ambient capabilities**: no fs, net, env, `Deno`, `eval` or
//!   function constructors
//! - **Wall-clock timeout**: enforced by a watchdog inside the VM and by the
//!   async pump while awaiting host calls, and still armed while the result
//!   is copied out
//! - **Bounded output**: the result and each console argument are copied to
//!   the host under a size budget on the order of the heap cap

pub mod bridge;
pub mod console;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod ops;
pub mod pump;
pub mod runtime;

use std::sync::Arc;

use codemux_error::DispatchError;
use serde_json::Value;

pub use bridge::{DumpError, DumpLimits, HostFunction, HostValue};
pub use console::{ConsoleLog, LogLevel};
pub use context::ExecutionContext;
pub use engine::{Engine, RuntimeLimits};
pub use error::SandboxError;
pub use executor::{
    ExecutionOutcome, ExecutionResult, RunCodeRequest, SandboxConfig, SandboxExecutor,
};
pub use runtime::SandboxRuntime;

/// A host-side tool exposed to sandbox code.
///
/// Script code sees each handler as an async function on the `tools` object:
/// `await tools.name(args)`. Implementations hold credentials and connections;
/// the sandbox only ever sees the JSON they return.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Invoke the tool with the script-supplied arguments.
    async fn call(&self, args: Value) -> Result<Value, DispatchError>;
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, DispatchError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, DispatchError>> + Send + 'static,
{
    async fn call(&self, args: Value) -> Result<Value, DispatchError> {
        (self.0)(args).await
    }
}
