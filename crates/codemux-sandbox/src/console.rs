//! Diagnostics capture: `console.log/warn/error` buffered as structured records.

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::v8;
use serde::{Deserialize, Serialize};

use crate::bridge::{self, DumpError, DumpLimits};

/// Severity of a captured console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.log`
    Log,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl LogLevel {
    /// Parse the method name used by the console shim.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "log" => Some(Self::Log),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// The console method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One captured console call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLog {
    /// Which console method was called.
    #[serde(rename = "type")]
    pub level: LogLevel,
    /// The arguments, stringified and joined by single spaces.
    pub content: String,
}

impl ConsoleLog {
    /// Build a record.
    pub fn new(level: LogLevel, content: impl Into<String>) -> Self {
        Self {
            level,
            content: content.into(),
        }
    }
}

/// Total console content kept per execution.
pub const MAX_CONSOLE_BYTES: usize = bridge::MAX_DUMP_BYTES;

#[derive(Default)]
struct SinkState {
    attached: bool,
    bytes: usize,
    truncated: bool,
    records: Vec<ConsoleLog>,
}

/// Append-only buffer shared between the console op and the capture.
#[derive(Clone, Default)]
pub(crate) struct ConsoleSink(Rc<RefCell<SinkState>>);

impl ConsoleSink {
    pub(crate) fn push(&self, level: LogLevel, content: String) {
        let mut state = self.0.borrow_mut();
        if !state.attached || state.truncated {
            return;
        }
        if state.bytes.saturating_add(content.len()) > MAX_CONSOLE_BYTES {
            tracing::warn!(
                target: "codemux::sandbox::console",
                max_bytes = MAX_CONSOLE_BYTES,
                "console output truncated"
            );
            state.truncated = true;
            state.records.push(ConsoleLog {
                level: LogLevel::Warn,
                content: format!("console output truncated after {MAX_CONSOLE_BYTES} bytes"),
            });
            return;
        }
        state.bytes += content.len();
        tracing::debug!(
            target: "codemux::sandbox::console",
            level = level.as_str(),
            "{}",
            content
        );
        state.records.push(ConsoleLog { level, content });
    }

    fn set_attached(&self, attached: bool) {
        self.0.borrow_mut().attached = attached;
    }

    fn snapshot(&self) -> Vec<ConsoleLog> {
        self.0.borrow().records.clone()
    }

    fn take(&self) -> Vec<ConsoleLog> {
        std::mem::take(&mut self.0.borrow_mut().records)
    }
}

/// The installed console for one execution context.
///
/// Records are kept in call order. Disposing detaches the sink, so console
/// calls made afterwards (e.g. by late microtasks) are dropped.
pub struct DiagnosticsCapture {
    sink: ConsoleSink,
}

impl DiagnosticsCapture {
    pub(crate) fn attach(sink: ConsoleSink) -> Self {
        sink.set_attached(true);
        Self { sink }
    }

    /// Records captured so far.
    pub fn logs(&self) -> Vec<ConsoleLog> {
        self.sink.snapshot()
    }

    /// Detach and hand back every record captured.
    pub fn dispose(self) -> Vec<ConsoleLog> {
        self.sink.set_attached(false);
        self.sink.take()
    }
}

impl Drop for DiagnosticsCapture {
    fn drop(&mut self) {
        self.sink.set_attached(false);
    }
}

/// Stringify one console argument: strings verbatim, everything else as JSON.
///
/// `None` when the isolate was terminated while reading the argument.
pub(crate) fn render_arg<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Option<String> {
    if value.is_string() {
        return Some(value.to_rust_string_lossy(scope));
    }
    if value.is_undefined() {
        return Some("undefined".into());
    }
    if value.is_function() {
        return Some("[Function]".into());
    }
    if let Ok(symbol) = v8::Local::<v8::Symbol>::try_from(value) {
        let description = symbol.description(scope);
        let description = if description.is_undefined() {
            String::new()
        } else {
            description.to_rust_string_lossy(scope)
        };
        return Some(format!("Symbol({description})"));
    }
    match bridge::from_sandbox(scope, value, DumpLimits::default()) {
        Ok(dumped) => Some(serde_json::to_string(&dumped).unwrap_or_default()),
        Err(DumpError::Terminated) => None,
        Err(e) => Some(format!("[{e}]")),
    }
}

/// Join rendered arguments the way `console.log` does.
pub fn format_console_args<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(part.as_ref());
    }
    out
}
