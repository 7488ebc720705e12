//! Sandbox executor: `run_code` orchestration.
//!
//! Each execution gets a brand new runtime and context. No state leaks
//! between calls, and nothing escapes as an `Err`: every failure ends up in
//! the `error` field of an [`ExecutionResult`] next to the console output
//! captured before it.
//!
//! V8 isolates are `!Send`, so all runtime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use codemux_config::SandboxOverrides;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;

use crate::bridge::{HostFunction, HostValue};
use crate::console::ConsoleLog;
use crate::context::ExecutionContext;
use crate::engine::{Engine, RuntimeLimits};
use crate::error::SandboxError;
use crate::metrics::SandboxMetrics;
use crate::ToolHandler;

/// Diagnostic name of the evaluated module.
const MODULE_NAME: &str = "main.js";

/// Name of the global the tools object is bridged to.
const TOOLS_GLOBAL: &str = "tools";

/// Configuration for the sandbox executor.
///
/// Heap and stack caps are deliberately absent; see [`RuntimeLimits`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Timeout used when a request does not carry its own.
    pub timeout: Duration,
    /// Maximum concurrent sandbox executions.
    pub max_concurrent: usize,
    /// Maximum size of the script in bytes.
    pub max_code_size: usize,
    /// Maximum host function calls per execution.
    pub max_host_calls: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_concurrent: 8,
            max_code_size: 256 * 1024, // 256 KB
            max_host_calls: 256,
        }
    }
}

impl SandboxConfig {
    /// Defaults with the configured overrides applied.
    pub fn with_overrides(overrides: &SandboxOverrides) -> Self {
        let defaults = Self::default();
        Self {
            timeout: overrides
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            max_concurrent: overrides.max_concurrent.unwrap_or(defaults.max_concurrent),
            max_code_size: overrides
                .max_code_size_kb
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.max_code_size),
            max_host_calls: overrides.max_host_calls.unwrap_or(defaults.max_host_calls),
        }
    }
}

/// Input of one `run_code` call.
pub struct RunCodeRequest {
    /// ES module source whose default export is `(tools) => any`.
    pub code: String,
    /// Wall-clock budget; the executor's default when `None`.
    pub timeout: Option<Duration>,
    /// Tools bridged onto `globalThis.tools` and passed to the default export.
    pub tools: BTreeMap<String, Arc<dyn ToolHandler>>,
    /// Extra globals bridged onto `globalThis`.
    pub globals: BTreeMap<String, HostValue>,
}

impl RunCodeRequest {
    /// A request with no tools, no globals and the default timeout.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout: None,
            tools: BTreeMap::new(),
            globals: BTreeMap::new(),
        }
    }

    /// Set the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a tool.
    pub fn with_tool(mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.insert(name.into(), handler);
        self
    }

    /// Replace the whole tool mapping.
    pub fn with_tools(mut self, tools: BTreeMap<String, Arc<dyn ToolHandler>>) -> Self {
        self.tools = tools;
        self
    }

    /// Add a global.
    pub fn with_global(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.globals.insert(name.into(), value.into());
        self
    }
}

/// Either the script's return value or the reason it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    /// The default export's (awaited) return value.
    #[serde(rename = "returnValue")]
    Returned(Value),
    /// A human-readable failure reason.
    #[serde(rename = "error")]
    Failed(String),
}

/// Result of `run_code`: exactly one of `returnValue` / `error`, plus logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// The outcome, flattened into `returnValue` or `error`.
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
    /// Console records in call order.
    pub console_logs: Vec<ConsoleLog>,
}

impl ExecutionResult {
    /// A successful result.
    pub fn returned(value: Value, console_logs: Vec<ConsoleLog>) -> Self {
        Self {
            outcome: ExecutionOutcome::Returned(value),
            console_logs,
        }
    }

    /// A failed result.
    pub fn failed(error: impl Into<String>, console_logs: Vec<ConsoleLog>) -> Self {
        Self {
            outcome: ExecutionOutcome::Failed(error.into()),
            console_logs,
        }
    }

    /// The return value, if the script succeeded.
    pub fn return_value(&self) -> Option<&Value> {
        match &self.outcome {
            ExecutionOutcome::Returned(value) => Some(value),
            ExecutionOutcome::Failed(_) => None,
        }
    }

    /// The failure reason, if the script failed.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ExecutionOutcome::Returned(_) => None,
            ExecutionOutcome::Failed(error) => Some(error),
        }
    }

    /// Whether the script succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Returned(_))
    }
}

type RawOutcome = (Result<Value, SandboxError>, Vec<ConsoleLog>);

/// The sandbox executor. Creates a fresh runtime for each execution.
///
/// This is `Send + Sync` safe: all V8 operations are dispatched to a
/// dedicated thread internally. A concurrency semaphore limits the number
/// of simultaneous isolates.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    metrics: Option<Arc<SandboxMetrics>>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            metrics: None,
        }
    }

    /// Create a new sandbox executor that records into `metrics`.
    pub fn with_metrics(config: SandboxConfig, metrics: Arc<SandboxMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new(config)
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one module against `request.tools`. Never fails; see [`ExecutionResult`].
    pub async fn run_code(&self, request: RunCodeRequest) -> ExecutionResult {
        let execution_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("run_code", %execution_id);
        async move {
            let started = Instant::now();
            tracing::info!(
                code_len = request.code.len(),
                tools = request.tools.len(),
                globals = request.globals.len(),
                "run_code: starting"
            );

            let (outcome, logs) = match self.admit(&request) {
                Ok(permit) => self.spawn_execution(permit, request).await,
                Err(e) => (Err(e), Vec::new()),
            };

            let elapsed = started.elapsed();
            if let Some(metrics) = &self.metrics {
                let kind = outcome.as_ref().err().map(SandboxError::kind);
                metrics.record_execution(kind, elapsed.as_secs_f64());
            }
            match &outcome {
                Ok(_) => tracing::info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    console_logs = logs.len(),
                    "run_code: complete"
                ),
                Err(e) => tracing::warn!(
                    error = %e,
                    kind = e.kind(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "run_code: failed"
                ),
            }
            into_result(outcome, logs)
        }
        .instrument(span)
        .await
    }

    fn admit(&self, request: &RunCodeRequest) -> Result<OwnedSemaphorePermit, SandboxError> {
        check_code_size(&self.config, &request.code)?;
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            })
    }

    async fn spawn_execution(
        &self,
        permit: OwnedSemaphorePermit,
        request: RunCodeRequest,
    ) -> RawOutcome {
        let config = self.config.clone();
        let span = tracing::Span::current();

        // V8 isolates are !Send, so everything runs on a dedicated thread
        let (tx, rx) = tokio::sync::oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("codemux-sandbox".into())
            .spawn(move || {
                let _permit = permit;
                let _entered = span.enter();
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if tx.send((Err(SandboxError::Execution(e.into())), Vec::new())).is_err() {
                            tracing::warn!("sandbox result receiver dropped");
                        }
                        return;
                    }
                };
                let outcome = rt.block_on(execute(&config, request));
                if tx.send(outcome).is_err() {
                    tracing::warn!("sandbox result receiver dropped before result was sent");
                }
            });

        if let Err(e) = spawned {
            return (Err(SandboxError::Execution(e.into())), Vec::new());
        }
        rx.await.unwrap_or_else(|_| {
            (
                Err(SandboxError::Execution(anyhow::anyhow!(
                    "sandbox thread panicked"
                ))),
                Vec::new(),
            )
        })
    }
}

/// Run one execution on the current thread.
///
/// Must be called from a thread that can own a V8 isolate (not from a
/// multi-threaded runtime's worker that may move the future). Does not
/// apply the executor's concurrency limit.
pub async fn run_code_on_current_thread(
    config: &SandboxConfig,
    request: RunCodeRequest,
) -> ExecutionResult {
    let (outcome, logs) = execute(config, request).await;
    into_result(outcome, logs)
}

fn into_result(outcome: Result<Value, SandboxError>, logs: Vec<ConsoleLog>) -> ExecutionResult {
    match outcome {
        Ok(value) => ExecutionResult::returned(value, logs),
        Err(e) => ExecutionResult::failed(e.to_string(), logs),
    }
}

fn check_code_size(config: &SandboxConfig, code: &str) -> Result<(), SandboxError> {
    if code.len() > config.max_code_size {
        return Err(SandboxError::CodeTooLarge {
            max: config.max_code_size,
            actual: code.len(),
        });
    }
    Ok(())
}

async fn execute(config: &SandboxConfig, request: RunCodeRequest) -> RawOutcome {
    if let Err(e) = check_code_size(config, &request.code) {
        return (Err(e), Vec::new());
    }
    let timeout = request.timeout.unwrap_or(config.timeout);

    let mut runtime = match Engine::get().create_runtime(RuntimeLimits::default()) {
        Ok(runtime) => runtime,
        Err(e) => return (Err(e), Vec::new()),
    };

    let mut ctx = runtime.new_context(Some(timeout));
    ctx.limit_host_calls(config.max_host_calls);
    let outcome = run_module(&mut ctx, request, timeout).await;
    let logs = ctx.dispose();
    (outcome, logs)
}

async fn run_module(
    ctx: &mut ExecutionContext<'_>,
    request: RunCodeRequest,
    timeout: Duration,
) -> Result<Value, SandboxError> {
    ctx.install_console()?;

    let namespace = ctx.evaluate_module(MODULE_NAME, &request.code).await?;

    let tools = HostValue::Object(
        request
            .tools
            .into_iter()
            .map(|(name, handler)| (name, HostValue::Function(HostFunction::from_handler(handler))))
            .collect(),
    );
    let tools = ctx.inject_global(TOOLS_GLOBAL, &tools)?;
    for (name, value) in &request.globals {
        ctx.inject_global(name, value)?;
    }

    let entry = ctx.default_export(&namespace)?;
    let returned = ctx.call(&entry, &[tools])?;
    let settled = ctx.resolve(returned, timeout).await?;
    ctx.drain_pending_jobs().await;

    ctx.dump(&settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_serializes_return_value_and_logs() {
        let result = ExecutionResult::returned(
            json!({"a": 1}),
            vec![ConsoleLog::new(crate::LogLevel::Log, "hi")],
        );
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"returnValue": {"a": 1}, "consoleLogs": [{"type": "log", "content": "hi"}]})
        );
    }

    #[test]
    fn result_serializes_error_without_return_value() {
        let result = ExecutionResult::failed("boom", Vec::new());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"error": "boom", "consoleLogs": []}));
        assert!(value.get("returnValue").is_none());
        assert_eq!(result.error(), Some("boom"));
        assert!(!result.is_ok());
    }

    #[test]
    fn result_deserializes_from_wire_shape() {
        let result: ExecutionResult =
            serde_json::from_value(json!({"returnValue": 3, "consoleLogs": []})).unwrap();
        assert_eq!(result.return_value(), Some(&json!(3)));
    }

    #[test]
    fn overrides_replace_defaults() {
        let config = SandboxConfig::with_overrides(&SandboxOverrides {
            timeout_ms: Some(1500),
            max_concurrent: None,
            max_code_size_kb: Some(4),
            max_host_calls: Some(3),
        });
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.max_code_size, 4096);
        assert_eq!(config.max_host_calls, 3);
    }

    #[tokio::test]
    async fn oversized_code_is_rejected_before_a_runtime_exists() {
        let exec = SandboxExecutor::new(SandboxConfig {
            max_code_size: 16,
            ..Default::default()
        });
        let result = exec
            .run_code(RunCodeRequest::new("export default () => 'this is long';"))
            .await;
        assert!(result.error().unwrap().contains("maximum size"), "{result:?}");
    }

    #[tokio::test]
    async fn concurrency_limit_enforced() {
        // max_concurrent=0 admits nothing, which keeps the test deterministic
        let exec = SandboxExecutor::new(SandboxConfig {
            max_concurrent: 0,
            ..Default::default()
        });
        let result = exec
            .run_code(RunCodeRequest::new("export default () => 1;"))
            .await;
        assert!(
            result.error().unwrap().contains("concurrency limit"),
            "expected concurrency limit, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn metrics_record_failures_by_kind() {
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(SandboxMetrics::new(&mut registry));
        let exec = SandboxExecutor::with_metrics(SandboxConfig::default(), metrics.clone());

        exec.run_code(RunCodeRequest::new("export default 42;")).await;
        exec.run_code(RunCodeRequest::new("export default () => 1;")).await;

        let invalid = crate::metrics::ErrorLabels {
            error_kind: "invalid_export".into(),
        };
        assert_eq!(metrics.errors_total.get_or_create(&invalid).get(), 1);
        let ok = crate::metrics::ExecutionLabels {
            outcome: "ok".into(),
        };
        assert_eq!(metrics.executions_total.get_or_create(&ok).get(), 1);
    }

    #[tokio::test]
    async fn runs_on_current_thread() {
        let result = run_code_on_current_thread(
            &SandboxConfig::default(),
            RunCodeRequest::new("export default async () => [1, 'two', { three: 3 }];"),
        )
        .await;
        assert_eq!(result.return_value(), Some(&json!([1, "two", {"three": 3}])));
    }
}
