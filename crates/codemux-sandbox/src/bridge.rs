//! Value bridge between host values and V8 handles.
//!
//! Host data crosses into the isolate through [`to_sandbox`], which builds
//! native V8 values recursively. Host functions are never exposed as raw
//! callbacks: each one is registered in a [`HostFunctionRegistry`] under a
//! numeric id and materialized by the bootstrap's `hostFunction(id)` factory,
//! which routes calls through the `op_sandbox_call_host` op.
//!
//! Values leave the isolate through [`from_sandbox`], a deep dump with JSON
//! semantics: `undefined`, functions and symbols become `null` (or are
//! omitted as object members), bigints become decimal strings and cycles are
//! cut with a `"[Circular]"` marker. The dump is bounded by [`DumpLimits`]
//! and aborts when the isolate is terminated underneath it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::v8;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::ToolHandler;

/// Maximum nesting depth followed when dumping a VM value.
pub const MAX_DUMP_DEPTH: usize = 128;

/// Default cap on values visited by one dump.
pub const MAX_DUMP_ITEMS: usize = 1 << 20;

/// Default cap on the host copy of one dump, on the order of the VM heap cap.
pub const MAX_DUMP_BYTES: usize = 32 * 1024 * 1024;

type HostFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// A host closure callable from sandbox code.
///
/// Receives the script's arguments as JSON values and resolves to a JSON
/// value. An `Err` rejects the script-side promise with
/// `HostFunctionError: <message>`.
#[derive(Clone)]
pub struct HostFunction(Arc<HostFn>);

impl HostFunction {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move |args| Box::pin(f(args))))
    }

    /// Expose a [`ToolHandler`]: the first script argument becomes the tool's
    /// argument map (`{}` when omitted or `null`). Failures reach the script
    /// as [`DispatchError::describe`](codemux_error::DispatchError::describe)
    /// text.
    pub fn from_handler(handler: Arc<dyn ToolHandler>) -> Self {
        Self::new(move |args: Vec<Value>| {
            let handler = handler.clone();
            async move {
                let args = args
                    .into_iter()
                    .next()
                    .filter(|v| !v.is_null())
                    .unwrap_or_else(|| Value::Object(Default::default()));
                handler
                    .call(args)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.describe(None)))
            }
        })
    }

    /// Invoke the closure.
    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.0)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostFunction")
    }
}

/// A host-side value that can be injected into the sandbox.
#[derive(Debug, Clone)]
pub enum HostValue {
    /// `undefined`.
    Undefined,
    /// `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(f64),
    /// A string.
    String(String),
    /// A bigint; crosses into the VM as its decimal string.
    BigInt(i128),
    /// A symbol description; crosses into the VM as `Symbol(<description>)`.
    Symbol(String),
    /// An array, converted element by element.
    Array(Vec<HostValue>),
    /// A plain object, converted key by key.
    Object(BTreeMap<String, HostValue>),
    /// A host function.
    Function(HostFunction),
}

impl HostValue {
    /// Build an object value from `(key, value)` pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, HostValue)>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Renders the value the way JavaScript's `String(value)` would.
impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => fmt_number(f, *n),
            Self::String(s) => f.write_str(s),
            Self::BigInt(n) => write!(f, "{n}"),
            Self::Symbol(desc) => write!(f, "Symbol({desc})"),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    if !matches!(item, Self::Undefined | Self::Null) {
                        write!(f, "{item}")?;
                    }
                }
                Ok(())
            }
            Self::Object(_) => f.write_str("[object Object]"),
            Self::Function(_) => f.write_str("function () { [native code] }"),
        }
    }
}

fn fmt_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_nan() {
        f.write_str("NaN")
    } else if n.is_infinite() {
        f.write_str(if n > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        write!(f, "{n}")
    }
}

impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<HostFunction> for HostValue {
    fn from(f: HostFunction) -> Self {
        Self::Function(f)
    }
}

/// Per-runtime table of host functions reachable from the VM.
///
/// Ids are indices; entries live as long as the runtime. Shared with the
/// `op_sandbox_call_host` op through `OpState`.
#[derive(Clone, Default)]
pub struct HostFunctionRegistry(Rc<RefCell<Vec<HostFunction>>>);

impl HostFunctionRegistry {
    /// Register a function and return its id.
    pub fn register(&self, f: HostFunction) -> u32 {
        let mut table = self.0.borrow_mut();
        table.push(f);
        (table.len() - 1) as u32
    }

    /// Look up a function by id.
    pub fn get(&self, id: u32) -> Option<HostFunction> {
        self.0.borrow().get(id as usize).cloned()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Whether no function has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// Turns registry ids into VM functions via the bootstrap's factory.
pub struct FunctionFactory<'a, 'f> {
    registry: &'a HostFunctionRegistry,
    make: v8::Local<'f, v8::Function>,
}

impl<'a, 'f> FunctionFactory<'a, 'f> {
    /// `make` is the bootstrap's `hostFunction(id)`.
    pub fn new(registry: &'a HostFunctionRegistry, make: v8::Local<'f, v8::Function>) -> Self {
        Self { registry, make }
    }

    fn materialize<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        f: &HostFunction,
    ) -> Option<v8::Local<'s, v8::Value>> {
        let id = self.registry.register(f.clone());
        let id = v8::Integer::new_from_unsigned(scope, id);
        let recv = v8::undefined(scope);
        self.make.call(scope, recv.into(), &[id.into()])
    }
}

/// Convert a host value into a VM value.
///
/// Never fails: a value that cannot be converted falls back to its
/// `String(value)` form, and to `undefined` if even that cannot be built.
pub fn to_sandbox<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &HostValue,
    factory: &FunctionFactory<'_, '_>,
) -> v8::Local<'s, v8::Value> {
    if let Some(converted) = try_to_sandbox(scope, value, factory) {
        return converted;
    }
    tracing::debug!("host value conversion failed, falling back to its string form");
    match v8::String::new(scope, &value.to_string()) {
        Some(s) => s.into(),
        None => v8::undefined(scope).into(),
    }
}

fn try_to_sandbox<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &HostValue,
    factory: &FunctionFactory<'_, '_>,
) -> Option<v8::Local<'s, v8::Value>> {
    let converted: v8::Local<v8::Value> = match value {
        HostValue::Undefined => v8::undefined(scope).into(),
        HostValue::Null => v8::null(scope).into(),
        HostValue::Bool(b) => v8::Boolean::new(scope, *b).into(),
        HostValue::Number(n) => v8::Number::new(scope, *n).into(),
        HostValue::String(s) => v8::String::new(scope, s)?.into(),
        HostValue::BigInt(_) | HostValue::Symbol(_) => {
            v8::String::new(scope, &value.to_string())?.into()
        }
        HostValue::Array(items) => {
            let array = v8::Array::new(scope, i32::try_from(items.len()).ok()?);
            for (index, item) in items.iter().enumerate() {
                // Element temporaries are released with this scope once stored.
                let scope = &mut v8::HandleScope::new(scope);
                let element = to_sandbox(scope, item, factory);
                array.set_index(scope, u32::try_from(index).ok()?, element)?;
            }
            array.into()
        }
        HostValue::Object(entries) => {
            let object = v8::Object::new(scope);
            for (key, item) in entries {
                let scope = &mut v8::HandleScope::new(scope);
                let key = v8::String::new(scope, key)?;
                let element = to_sandbox(scope, item, factory);
                // Own data property: prototype setters never observe injected values.
                object.create_data_property(scope, key.into(), element)?;
            }
            object.into()
        }
        HostValue::Function(f) => factory.materialize(scope, f)?,
    };
    Some(converted)
}

/// Deep-dump a VM value into JSON.
///
/// Getters, proxy traps and `toJSON` methods are invoked along the way. A
/// member whose getter throws is omitted. Termination of the isolate (by
/// the deadline watchdog or the heap callback) aborts the dump, as does a
/// value larger than `limits`. Shared references are charged once per
/// occurrence, so repeating one large string cannot grow the host copy past
/// the budget.
pub fn from_sandbox<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    limits: DumpLimits,
) -> Result<Value, DumpError> {
    let mut walk = Walk {
        ancestors: Vec::new(),
        limits,
        items: 0,
        bytes: 0,
    };
    Ok(dump(scope, value, &mut walk)?.unwrap_or(Value::Null))
}

/// Size budget for one dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpLimits {
    /// Values visited, counting every array element and object member.
    pub max_items: usize,
    /// Approximate bytes of the host copy: string and key lengths plus a
    /// fixed charge per scalar.
    pub max_bytes: usize,
}

impl Default for DumpLimits {
    fn default() -> Self {
        Self {
            max_items: MAX_DUMP_ITEMS,
            max_bytes: MAX_DUMP_BYTES,
        }
    }
}

/// Why a dump was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DumpError {
    /// The isolate was terminated while user code ran inside the dump.
    #[error("execution terminated while reading the value")]
    Terminated,
    /// The value is larger than the dump budget.
    #[error("value exceeds the output limit of {limit} {unit}")]
    TooLarge {
        /// The budget that was exceeded.
        limit: usize,
        /// `"items"` or `"bytes"`.
        unit: &'static str,
    },
}

const SCALAR_BYTES: usize = 8;

struct Walk<'s> {
    ancestors: Vec<v8::Local<'s, v8::Object>>,
    limits: DumpLimits,
    items: usize,
    bytes: usize,
}

impl Walk<'_> {
    fn charge(&mut self, bytes: usize) -> Result<(), DumpError> {
        self.items += 1;
        self.bytes = self.bytes.saturating_add(bytes);
        if self.items > self.limits.max_items {
            return Err(DumpError::TooLarge {
                limit: self.limits.max_items,
                unit: "items",
            });
        }
        if self.bytes > self.limits.max_bytes {
            return Err(DumpError::TooLarge {
                limit: self.limits.max_bytes,
                unit: "bytes",
            });
        }
        Ok(())
    }

    /// Fail before walking `len` elements that cannot fit anyway.
    fn reserve(&self, len: usize) -> Result<(), DumpError> {
        if len > self.limits.max_items.saturating_sub(self.items) {
            return Err(DumpError::TooLarge {
                limit: self.limits.max_items,
                unit: "items",
            });
        }
        Ok(())
    }
}

/// Run `f`, which may re-enter user code, and report termination.
/// Ordinary exceptions are swallowed and surface as `None`.
fn guarded<'s, T>(
    scope: &mut v8::HandleScope<'s>,
    f: impl FnOnce(&mut v8::HandleScope<'s>) -> Option<T>,
) -> Result<Option<T>, DumpError> {
    let tc = &mut v8::TryCatch::new(scope);
    let out = f(tc);
    if tc.has_terminated() || tc.is_execution_terminating() {
        return Err(DumpError::Terminated);
    }
    Ok(out)
}

/// `Ok(None)` means "no JSON representation": `null` in arrays, omitted in objects.
fn dump<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    walk: &mut Walk<'s>,
) -> Result<Option<Value>, DumpError> {
    if value.is_undefined() || value.is_function() || value.is_symbol() {
        walk.charge(0)?;
        return Ok(None);
    }
    if value.is_null() {
        walk.charge(SCALAR_BYTES)?;
        return Ok(Some(Value::Null));
    }
    if value.is_boolean() {
        walk.charge(SCALAR_BYTES)?;
        return Ok(Some(Value::Bool(value.is_true())));
    }
    if value.is_number() {
        walk.charge(SCALAR_BYTES)?;
        let n = value.number_value(scope).unwrap_or(f64::NAN);
        return Ok(Some(number_to_json(n)));
    }
    if let Ok(string) = v8::Local::<v8::String>::try_from(value) {
        // UTF-16 length is a lower bound on the UTF-8 copy; checked before copying.
        walk.charge(string.length())?;
        return Ok(Some(Value::String(string.to_rust_string_lossy(scope))));
    }
    if value.is_big_int() {
        let digits = value.to_rust_string_lossy(scope);
        walk.charge(digits.len())?;
        return Ok(Some(Value::String(digits)));
    }

    walk.charge(SCALAR_BYTES)?;
    let Some(object) = guarded(scope, |scope| value.to_object(scope))? else {
        return Ok(None);
    };
    if walk.ancestors.iter().any(|a| a.strict_equals(value)) {
        return Ok(Some(Value::String("[Circular]".into())));
    }
    if walk.ancestors.len() >= MAX_DUMP_DEPTH {
        return Ok(Some(Value::String("[MaxDepth]".into())));
    }

    if let Some(replacement) = guarded(scope, |scope| call_to_json(scope, object))? {
        if !replacement.strict_equals(value) {
            // Counted as a level so that chained toJSON results stay bounded.
            walk.ancestors.push(object);
            let dumped = dump(scope, replacement, walk);
            walk.ancestors.pop();
            return dumped;
        }
    }

    walk.ancestors.push(object);
    let dumped = match v8::Local::<v8::Array>::try_from(value) {
        Ok(array) => dump_elements(scope, array, walk),
        Err(_) => dump_members(scope, object, walk),
    };
    walk.ancestors.pop();
    dumped
}

fn dump_elements<'s>(
    scope: &mut v8::HandleScope<'s>,
    array: v8::Local<'s, v8::Array>,
    walk: &mut Walk<'s>,
) -> Result<Option<Value>, DumpError> {
    let length = array.length();
    walk.reserve(length as usize)?;
    let mut items = Vec::new();
    for index in 0..length {
        let item = guarded(scope, |scope| array.get_index(scope, index))?
            .unwrap_or_else(|| v8::undefined(scope).into());
        items.push(dump(scope, item, walk)?.unwrap_or(Value::Null));
    }
    Ok(Some(Value::Array(items)))
}

fn dump_members<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    walk: &mut Walk<'s>,
) -> Result<Option<Value>, DumpError> {
    let names = guarded(scope, |scope| {
        object.get_own_property_names(
            scope,
            v8::GetPropertyNamesArgs {
                mode: v8::KeyCollectionMode::OwnOnly,
                property_filter: v8::PropertyFilter::ONLY_ENUMERABLE
                    | v8::PropertyFilter::SKIP_SYMBOLS,
                index_filter: v8::IndexFilter::IncludeIndices,
                key_conversion: v8::KeyConversionMode::ConvertToString,
            },
        )
    })?;
    let Some(names) = names else {
        return Ok(Some(Value::Object(serde_json::Map::new())));
    };
    walk.reserve(names.length() as usize)?;

    let mut members = serde_json::Map::new();
    for index in 0..names.length() {
        let Some(key) = names.get_index(scope, index) else {
            continue;
        };
        let Some(member) = guarded(scope, |scope| object.get(scope, key))? else {
            continue;
        };
        let name = key.to_rust_string_lossy(scope);
        walk.bytes = walk.bytes.saturating_add(name.len());
        if let Some(dumped) = dump(scope, member, walk)? {
            members.insert(name, dumped);
        }
    }
    Ok(Some(Value::Object(members)))
}

fn call_to_json<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
) -> Option<v8::Local<'s, v8::Value>> {
    let key = v8::String::new(scope, "toJSON")?;
    let method = object.get(scope, key.into())?;
    let method = v8::Local::<v8::Function>::try_from(method).ok()?;
    method.call(scope, object.into(), &[])
}

fn number_to_json(n: f64) -> Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if !n.is_finite() {
        Value::Null
    } else if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
