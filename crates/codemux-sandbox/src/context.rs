//! Execution context: one evaluation scope inside a [`SandboxRuntime`].
//!
//! The context holds an exclusive borrow of its runtime for its whole life,
//! arms the runtime's interrupt deadline on creation and disarms it on drop.
//! It owns the console capture and the evaluated module's handles.

use std::time::Duration;

use deno_core::{v8, ModuleSpecifier};
use serde_json::Value;

use crate::bridge::{self, DumpError, DumpLimits, FunctionFactory, HostValue};
use crate::console::{ConsoleLog, DiagnosticsCapture};
use crate::error::SandboxError;
use crate::ops::HostCallLimits;
use crate::pump::{self, PumpError};
use crate::runtime::SandboxRuntime;

/// An evaluation context with its own interrupt deadline.
pub struct ExecutionContext<'rt> {
    runtime: &'rt mut SandboxRuntime,
    timeout: Option<Duration>,
    diagnostics: Option<DiagnosticsCapture>,
}

impl<'rt> ExecutionContext<'rt> {
    pub(crate) fn new(runtime: &'rt mut SandboxRuntime, interrupt_after: Option<Duration>) -> Self {
        let mut ctx = Self {
            runtime,
            timeout: None,
            diagnostics: None,
        };
        ctx.set_interrupt_after(interrupt_after);
        ctx
    }

    /// Re-arm the runtime's deadline to fire `after` from now (`None` disarms it).
    pub fn set_interrupt_after(&mut self, after: Option<Duration>) {
        self.timeout = after;
        self.runtime.interrupt.set_after(after);
    }

    /// Install `console.log/warn/error` on the global object.
    pub fn install_console(&mut self) -> Result<(), SandboxError> {
        if self.diagnostics.is_some() {
            return Ok(());
        }
        let installed = {
            let rt = &mut *self.runtime;
            let scope = &mut rt.js.handle_scope();
            let helpers = v8::Local::new(scope, &rt.helpers);
            let install = helper_fn(scope, helpers, "installConsole")?;
            let tc = &mut v8::TryCatch::new(scope);
            install
                .call(tc, helpers.into(), &[])
                .map(|_| ())
                .ok_or_else(|| caught(tc))
        };
        installed.map_err(|e| self.classify(e))?;
        self.diagnostics = Some(DiagnosticsCapture::attach(self.runtime.console.clone()));
        Ok(())
    }

    /// Evaluate `code` as the main ES module and return its namespace.
    ///
    /// Top-level await is driven through the async pump.
    pub async fn evaluate_module(
        &mut self,
        name: &str,
        code: &str,
    ) -> Result<v8::Global<v8::Object>, SandboxError> {
        let specifier = ModuleSpecifier::parse(&format!("file:///sandbox/{name}")).map_err(|e| {
            SandboxError::Compile {
                message: format!("invalid module name '{name}': {e}"),
            }
        })?;

        let id = self
            .runtime
            .js
            .load_main_es_module_from_code(&specifier, code.to_string())
            .await
            .map_err(|e| self.classify(SandboxError::Compile {
                message: e.to_string(),
            }))?;

        let evaluation = self.runtime.js.mod_evaluate(id);
        let timeout = self.remaining(None);
        let evaluated = pump::drive_with_job_pump(&mut self.runtime.js, evaluation, timeout).await;
        match evaluated {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(self.classify(SandboxError::JsError {
                    message: e.to_string(),
                }))
            }
            Err(e) => return Err(self.pump_error(e)),
        }

        self.runtime
            .js
            .get_module_namespace(id)
            .map_err(|e| self.classify(SandboxError::Compile {
                message: e.to_string(),
            }))
    }

    /// Convert `value` and set it as `globalThis[name]`. Returns the VM value.
    pub fn inject_global(
        &mut self,
        name: &str,
        value: &HostValue,
    ) -> Result<v8::Global<v8::Value>, SandboxError> {
        let injected = {
            let rt = &mut *self.runtime;
            let scope = &mut rt.js.handle_scope();
            let helpers = v8::Local::new(scope, &rt.helpers);
            let make = helper_fn(scope, helpers, "hostFunction")?;
            let factory = FunctionFactory::new(&rt.registry, make);
            let tc = &mut v8::TryCatch::new(scope);
            let converted = bridge::to_sandbox(tc, value, &factory);
            let context = tc.get_current_context();
            let global = context.global(tc);
            let key = v8::String::new(tc, name).ok_or_else(|| SandboxError::JsError {
                message: format!("invalid global name '{name}'"),
            })?;
            match global.set(tc, key.into(), converted) {
                Some(true) => Ok(v8::Global::new(tc, converted)),
                _ => Err(caught(tc)),
            }
        };
        injected.map_err(|e| self.classify(e))
    }

    /// Read the module's `default` export, which must be a function.
    pub fn default_export(
        &mut self,
        namespace: &v8::Global<v8::Object>,
    ) -> Result<v8::Global<v8::Function>, SandboxError> {
        let export = {
            let scope = &mut self.runtime.js.handle_scope();
            let namespace = v8::Local::new(scope, namespace);
            let tc = &mut v8::TryCatch::new(scope);
            let key: Option<v8::Local<v8::Value>> =
                v8::String::new(tc, "default").map(|k| k.into());
            let export = key
                .and_then(|key| namespace.get(tc, key))
                .unwrap_or_else(|| v8::undefined(tc).into());
            match v8::Local::<v8::Function>::try_from(export) {
                Ok(function) => Ok(v8::Global::new(tc, function)),
                Err(_) if tc.has_terminated() => Err(caught(tc)),
                Err(_) => Err(SandboxError::InvalidExport {
                    found: export.type_of(tc).to_rust_string_lossy(tc),
                }),
            }
        };
        export.map_err(|e| self.classify(e))
    }

    /// Call `function` with `args` and `undefined` as receiver.
    pub fn call(
        &mut self,
        function: &v8::Global<v8::Function>,
        args: &[v8::Global<v8::Value>],
    ) -> Result<v8::Global<v8::Value>, SandboxError> {
        let returned = {
            let scope = &mut self.runtime.js.handle_scope();
            let function = v8::Local::new(scope, function);
            let args: Vec<v8::Local<v8::Value>> =
                args.iter().map(|a| v8::Local::new(scope, a)).collect();
            let recv = v8::undefined(scope).into();
            let tc = &mut v8::TryCatch::new(scope);
            match function.call(tc, recv, &args) {
                Some(value) => Ok(v8::Global::new(tc, value)),
                None => Err(caught(tc)),
            }
        };
        returned.map_err(|e| self.classify(e))
    }

    /// Await `value` through the async pump, bounded by `timeout` and by the
    /// context's own deadline.
    pub async fn resolve(
        &mut self,
        value: v8::Global<v8::Value>,
        timeout: Duration,
    ) -> Result<v8::Global<v8::Value>, SandboxError> {
        let timeout = self.remaining(Some(timeout));
        pump::resolve_promise_with_job_pump(&mut self.runtime.js, value, timeout)
            .await
            .map_err(|e| self.pump_error(e))
    }

    /// Best-effort final turn of the job queue. Failures are only logged.
    pub async fn drain_pending_jobs(&mut self) {
        if let Err(e) = pump::drain_pending_jobs(&mut self.runtime.js).await {
            tracing::debug!(error = %e, "trailing job failed after the result settled");
        }
    }

    /// Dump a VM value to JSON, bounded by the default [`DumpLimits`].
    ///
    /// Getters and `toJSON` run user code under the context's deadline, so a
    /// dump cut short by the watchdog or the heap cap is reported as such
    /// rather than as a partial value.
    pub fn dump(&mut self, value: &v8::Global<v8::Value>) -> Result<Value, SandboxError> {
        let dumped = {
            let scope = &mut self.runtime.js.handle_scope();
            let value = v8::Local::new(scope, value);
            bridge::from_sandbox(scope, value, DumpLimits::default())
        };
        let terminated = || SandboxError::JsError {
            message: "execution terminated".into(),
        };
        match dumped {
            Ok(_) if self.runtime.interrupted() || self.runtime.heap_limit_exceeded() => {
                Err(self.classify(terminated()))
            }
            Ok(value) => Ok(value),
            Err(DumpError::Terminated) => Err(self.classify(terminated())),
            Err(DumpError::TooLarge { limit, unit }) => {
                Err(SandboxError::OutputLimit { limit, unit })
            }
        }
    }

    /// Console records captured so far.
    pub fn console_logs(&self) -> Vec<ConsoleLog> {
        self.diagnostics
            .as_ref()
            .map(DiagnosticsCapture::logs)
            .unwrap_or_default()
    }

    /// Cap the number of host function calls for the rest of this context.
    pub fn limit_host_calls(&mut self, max_calls: usize) {
        self.runtime.js.op_state().borrow_mut().put(HostCallLimits {
            max_calls,
            calls_made: 0,
        });
    }

    /// Re-attribute a failure to the heap cap or the deadline when either
    /// tripped, in that order.
    pub fn classify(&self, err: SandboxError) -> SandboxError {
        if self.runtime.heap_limit_exceeded() {
            SandboxError::HeapLimitExceeded {
                limit_bytes: self.runtime.limits().memory_limit_bytes,
            }
        } else if self.runtime.interrupted() {
            SandboxError::Timeout {
                timeout_ms: self.timeout_ms(),
            }
        } else {
            err
        }
    }

    /// Detach the console and return everything it captured.
    pub fn dispose(mut self) -> Vec<ConsoleLog> {
        self.diagnostics
            .take()
            .map(DiagnosticsCapture::dispose)
            .unwrap_or_default()
    }

    fn pump_error(&self, err: PumpError) -> SandboxError {
        let err = match err {
            PumpError::TimedOut(_) => SandboxError::Timeout {
                timeout_ms: self.timeout_ms(),
            },
            PumpError::EventLoop(message) | PumpError::Rejected(message) => {
                SandboxError::JsError { message }
            }
        };
        self.classify(err)
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0)
    }

    fn remaining(&self, bound: Option<Duration>) -> Duration {
        let left = self.runtime.interrupt.remaining().unwrap_or(Duration::MAX);
        bound.map_or(left, |bound| bound.min(left))
    }
}

impl Drop for ExecutionContext<'_> {
    fn drop(&mut self) {
        self.runtime.interrupt.set_after(None);
    }
}

fn helper_fn<'s>(
    scope: &mut v8::HandleScope<'s>,
    helpers: v8::Local<'s, v8::Object>,
    name: &str,
) -> Result<v8::Local<'s, v8::Function>, SandboxError> {
    let missing = || SandboxError::Execution(anyhow::anyhow!("sandbox helper '{name}' missing"));
    let key = v8::String::new(scope, name).ok_or_else(missing)?;
    let value = helpers.get(scope, key.into()).ok_or_else(missing)?;
    v8::Local::<v8::Function>::try_from(value).map_err(|_| missing())
}

/// Turn the exception held by `tc` into an error. Termination is reported
/// as a plain JS error; [`ExecutionContext::classify`] re-attributes it.
fn caught(tc: &mut v8::TryCatch<v8::HandleScope>) -> SandboxError {
    if tc.has_terminated() {
        return SandboxError::JsError {
            message: "execution terminated".into(),
        };
    }
    let message = match tc.exception() {
        Some(exception) => {
            let message = v8::Exception::create_message(tc, exception);
            message.get(tc).to_rust_string_lossy(tc)
        }
        None => "unknown error".into(),
    };
    SandboxError::JsError { message }
}
