//! One isolated V8 runtime per execution.
//!
//! A [`SandboxRuntime`] owns the isolate, its heap cap, the runtime-scoped
//! interrupt watchdog, the host function registry and the console sink. It
//! is `!Send` and not `Clone`; the executor creates one per `run_code` call,
//! moves it onto the execution thread and drops it when the call is done, so
//! two executions can never race on the same interrupt deadline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, RuntimeOptions};

use crate::bridge::HostFunctionRegistry;
use crate::console::ConsoleSink;
use crate::context::ExecutionContext;
use crate::engine::RuntimeLimits;
use crate::error::SandboxError;
use crate::ops;

/// How often the watchdog compares the clock against the deadline.
const WATCHDOG_TICK: Duration = Duration::from_millis(5);

/// Installed before any user code runs. Captures the ops in closures,
/// strips `Deno`, `eval` and the function constructors, and returns the
/// frozen helper object. The helper object is never stored on `globalThis`.
const BOOTSTRAP: &str = r#"
((ops) => {
    const callHost = ops.op_sandbox_call_host;
    const writeConsole = ops.op_sandbox_console;
    const freeze = Object.freeze;
    const stringify = JSON.stringify;
    const parse = JSON.parse;
    const wireReplacer = (_key, value) =>
        typeof value === "bigint" ? value.toString() : value;
    const describe = (e) =>
        e && typeof e.message === "string" ? e.message : String(e);

    const hostFunction = (id) => freeze((...args) => {
        let payload;
        try {
            payload = stringify(args, wireReplacer);
        } catch (e) {
            return `HostFunctionError: ${describe(e)}`;
        }
        return callHost(id, payload).then(parse);
    });

    const installConsole = () => {
        const method = (level) => (...args) => { writeConsole(level, args); };
        Object.defineProperty(globalThis, "console", {
            value: freeze({
                log: method("log"),
                warn: method("warn"),
                error: method("error"),
            }),
            writable: true,
            configurable: true,
            enumerable: false,
        });
    };

    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction]) {
        Object.defineProperty(ctor.prototype, "constructor", {
            value: undefined, configurable: false, writable: false,
        });
    }
    delete globalThis.Function;

    return freeze({ hostFunction, installConsole });
})(Deno.core.ops);
"#;

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Set once by the callback; read by the context when classifying errors.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points into the runtime's boxed `HeapLimitState`. The
    // callback is removed in `SandboxRuntime::drop` before the box is freed,
    // and V8 only invokes it on the isolate's own thread.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// The runtime-scoped interrupt deadline.
///
/// `deadline_ms` is measured from `origin`; 0 disables the interrupt.
pub(crate) struct InterruptState {
    origin: Instant,
    deadline_ms: AtomicU64,
    fired: AtomicBool,
}

impl InterruptState {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            deadline_ms: AtomicU64::new(0),
            fired: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub(crate) fn set_after(&self, after: Option<Duration>) {
        let deadline = match after {
            Some(after) => self
                .now_ms()
                .saturating_add(after.as_millis() as u64)
                .max(1),
            None => 0,
        };
        self.deadline_ms.store(deadline, Ordering::SeqCst);
    }

    pub(crate) fn should_interrupt(&self) -> bool {
        let deadline = self.deadline_ms.load(Ordering::SeqCst);
        deadline != 0 && self.now_ms() > deadline
    }

    /// Time left before the deadline, `None` when disabled.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        match self.deadline_ms.load(Ordering::SeqCst) {
            0 => None,
            deadline => Some(Duration::from_millis(
                deadline.saturating_sub(self.now_ms()),
            )),
        }
    }

    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Thread that terminates the isolate once the deadline has passed.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn spawn(handle: v8::IsolateHandle, state: Arc<InterruptState>) -> std::io::Result<Self> {
        let (cancel, cancel_rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("codemux-watchdog".into())
            .spawn(move || loop {
                match cancel_rx.recv_timeout(WATCHDOG_TICK) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if state.should_interrupt() && !state.fired.swap(true, Ordering::SeqCst)
                        {
                            tracing::debug!("interrupt deadline passed, terminating isolate");
                            handle.terminate_execution();
                        }
                    }
                    _ => break,
                }
            })?;
        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        let _ = self.cancel.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// One isolated VM with fixed caps.
///
/// Field order matters: the helper handle must be released before the
/// isolate, and the heap state must outlive it.
pub struct SandboxRuntime {
    pub(crate) helpers: v8::Global<v8::Object>,
    pub(crate) js: JsRuntime,
    heap_state: Box<HeapLimitState>,
    pub(crate) interrupt: Arc<InterruptState>,
    watchdog: Watchdog,
    pub(crate) registry: HostFunctionRegistry,
    pub(crate) console: ConsoleSink,
    limits: RuntimeLimits,
}

impl SandboxRuntime {
    pub(crate) fn new(limits: RuntimeLimits) -> Result<Self, SandboxError> {
        let create_params =
            v8::CreateParams::default().heap_limits(0, limits.memory_limit_bytes);
        let mut js = JsRuntime::new(RuntimeOptions {
            extensions: vec![ops::sandbox_extension()],
            create_params: Some(create_params),
            ..Default::default()
        });

        let registry = HostFunctionRegistry::default();
        let console = ConsoleSink::default();
        {
            let state = js.op_state();
            let mut state = state.borrow_mut();
            state.put(registry.clone());
            state.put(console.clone());
        }

        let helpers = js
            .execute_script("[codemux:bootstrap]", BOOTSTRAP)
            .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;
        let helpers = {
            let scope = &mut js.handle_scope();
            let local = v8::Local::new(scope, helpers);
            let object = v8::Local::<v8::Object>::try_from(local).map_err(|_| {
                SandboxError::Execution(anyhow::anyhow!(
                    "bootstrap did not return a helper object"
                ))
            })?;
            v8::Global::new(scope, object)
        };

        let heap_state = Box::new(HeapLimitState {
            handle: js.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        js.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );

        let interrupt = Arc::new(InterruptState::new());
        let watchdog = match Watchdog::spawn(js.v8_isolate().thread_safe_handle(), interrupt.clone())
        {
            Ok(watchdog) => watchdog,
            Err(e) => {
                js.v8_isolate()
                    .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
                return Err(SandboxError::Execution(e.into()));
            }
        };

        tracing::debug!(
            memory_limit_bytes = limits.memory_limit_bytes,
            "sandbox runtime created"
        );

        Ok(Self {
            helpers,
            js,
            heap_state,
            interrupt,
            watchdog,
            registry,
            console,
            limits,
        })
    }

    /// Create an evaluation context. The runtime's single interrupt deadline
    /// is (re)armed to fire `interrupt_after` from now.
    pub fn new_context(&mut self, interrupt_after: Option<Duration>) -> ExecutionContext<'_> {
        ExecutionContext::new(self, interrupt_after)
    }

    /// The caps this runtime was created with.
    pub fn limits(&self) -> RuntimeLimits {
        self.limits
    }

    /// Whether the near-heap-limit callback has terminated execution.
    pub fn heap_limit_exceeded(&self) -> bool {
        self.heap_state.triggered.load(Ordering::SeqCst)
    }

    /// Whether the interrupt deadline has terminated execution.
    pub fn interrupted(&self) -> bool {
        self.interrupt.fired()
    }
}

impl Drop for SandboxRuntime {
    fn drop(&mut self) {
        // The watchdog holds an isolate handle; it must be gone before the isolate.
        self.watchdog.stop();
        self.js
            .v8_isolate()
            .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
        tracing::debug!("sandbox runtime disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;

    #[test]
    fn deadline_zero_is_disabled() {
        let state = InterruptState::new();
        assert!(!state.should_interrupt());
        assert_eq!(state.remaining(), None);

        state.set_after(Some(Duration::from_secs(60)));
        assert!(!state.should_interrupt());
        assert!(state.remaining().unwrap() > Duration::from_secs(59));

        state.set_after(None);
        assert_eq!(state.remaining(), None);
    }

    #[test]
    fn expired_deadline_requests_interrupt() {
        let state = InterruptState::new();
        state.set_after(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(state.should_interrupt());
        assert_eq!(state.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn bootstrap_hides_deno_eval_and_function() {
        let mut runtime = Engine::get()
            .create_runtime(RuntimeLimits::default())
            .unwrap();
        let kinds = runtime
            .js
            .execute_script(
                "[test:globals]",
                "[typeof Deno, typeof eval, typeof (() => {}).constructor, typeof Function].join(',')",
            )
            .unwrap();
        let scope = &mut runtime.js.handle_scope();
        let kinds = v8::Local::new(scope, kinds);
        assert_eq!(
            kinds.to_rust_string_lossy(scope),
            "undefined,undefined,undefined,undefined"
        );
    }

    #[test]
    fn runtime_drop_stops_watchdog() {
        let mut runtime = Engine::get()
            .create_runtime(RuntimeLimits::default())
            .unwrap();
        runtime.interrupt.set_after(Some(Duration::from_secs(60)));
        assert!(!runtime.interrupted());
        assert!(!runtime.heap_limit_exceeded());
        drop(runtime);
    }
}
