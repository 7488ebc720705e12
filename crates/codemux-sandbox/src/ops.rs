//! deno_core op definitions for the codemux sandbox.
//!
//! `#[op2]` generates public items that cannot carry doc comments, so
//! `missing_docs` is relaxed for this module.
#![allow(missing_docs)]

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

use codemux_error::DispatchError;
use deno_core::{op2, v8, Extension, JsRuntime, OpState};
use deno_error::JsErrorBox;
use serde_json::Value;

use crate::bridge::HostFunctionRegistry;
use crate::console::{format_console_args, render_arg, ConsoleSink, LogLevel};

/// Prefix of every host-side failure surfaced to script code.
pub const HOST_FUNCTION_ERROR: &str = "HostFunctionError";

/// Per-execution budget for host function calls.
pub struct HostCallLimits {
    /// Maximum number of host calls allowed.
    pub max_calls: usize,
    /// Number of host calls made so far.
    pub calls_made: usize,
}

/// Record one `console.*` call. `args` is the JS arguments array.
#[op2(fast)]
pub fn op_sandbox_console<'s>(
    scope: &mut v8::HandleScope<'s>,
    #[string] level: &str,
    args: v8::Local<'s, v8::Value>,
) {
    let Some(level) = LogLevel::parse(level) else {
        return;
    };

    // A terminated isolate drops the whole call.
    let mut parts = Vec::new();
    match v8::Local::<v8::Array>::try_from(args) {
        Ok(array) => {
            for index in 0..array.length() {
                let item = array
                    .get_index(scope, index)
                    .unwrap_or_else(|| v8::undefined(scope).into());
                let Some(part) = render_arg(scope, item) else {
                    return;
                };
                parts.push(part);
            }
        }
        Err(_) => match render_arg(scope, args) {
            Some(part) => parts.push(part),
            None => return,
        },
    }

    let sink = {
        let state = JsRuntime::op_state_from(scope);
        let state = state.borrow();
        state.try_borrow::<ConsoleSink>().cloned()
    };
    if let Some(sink) = sink {
        sink.push(level, format_console_args(parts));
    }
}

/// Call a registered host function.
///
/// `args_json` is the JSON array of the script's arguments. Enforces the
/// per-execution [`HostCallLimits`] stored in OpState. Host failures reject
/// the script-side promise with `HostFunctionError: <message>`.
#[op2(async)]
#[string]
pub async fn op_sandbox_call_host(
    op_state: Rc<RefCell<OpState>>,
    #[smi] id: u32,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(id, args_len = args_json.len(), "host call dispatched");

    {
        let mut st = op_state.borrow_mut();
        if let Some(limits) = st.try_borrow_mut::<HostCallLimits>() {
            if limits.calls_made >= limits.max_calls {
                return Err(host_error(DispatchError::RateLimit(format!(
                    "host call limit exceeded (max {} calls per execution)",
                    limits.max_calls
                ))));
            }
            limits.calls_made += 1;
        }
    }

    let function = {
        let st = op_state.borrow();
        st.try_borrow::<HostFunctionRegistry>()
            .and_then(|registry| registry.get(id))
    }
    .ok_or_else(|| host_error(format!("unknown host function #{id}")))?;

    let args = match serde_json::from_str::<Value>(&args_json) {
        Ok(Value::Array(args)) => args,
        Ok(other) => vec![other],
        Err(e) => return Err(host_error(format!("invalid JSON args: {e}"))),
    };

    let result = function.call(args).await.map_err(|e| {
        tracing::debug!(id, error = %e, "host call failed");
        host_error(e)
    })?;

    serde_json::to_string(&result)
        .map_err(|e| host_error(format!("result serialization failed: {e}")))
}

fn host_error(message: impl std::fmt::Display) -> JsErrorBox {
    JsErrorBox::generic(format!("{HOST_FUNCTION_ERROR}: {message}"))
}

/// The extension every sandbox runtime is created with.
pub fn sandbox_extension() -> Extension {
    Extension {
        name: "codemux_sandbox",
        ops: Cow::Owned(vec![op_sandbox_console(), op_sandbox_call_host()]),
        ..Default::default()
    }
}
