//! Process-wide engine handle.
//!
//! V8 flags can only be set before the first isolate exists and apply to
//! every isolate afterwards, so the stack cap lives here rather than on the
//! individual runtime.

use std::sync::OnceLock;

use crate::error::SandboxError;
use crate::runtime::SandboxRuntime;

/// Heap cap of every sandbox runtime (32 MiB).
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 32 * 1024 * 1024;

/// Stack cap of every sandbox runtime (512 KiB).
pub const DEFAULT_STACK_SIZE_BYTES: usize = 512 * 1024;

/// Resource caps for one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// V8 heap limit in bytes.
    pub memory_limit_bytes: usize,
    /// Stack limit in bytes. Must match the engine's.
    pub stack_size_bytes: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            stack_size_bytes: DEFAULT_STACK_SIZE_BYTES,
        }
    }
}

/// The lazily initialized engine singleton.
pub struct Engine {
    stack_size_bytes: usize,
}

static ENGINE: OnceLock<Engine> = OnceLock::new();

impl Engine {
    /// Return the engine, configuring V8 on first use.
    pub fn get() -> &'static Engine {
        ENGINE.get_or_init(|| Engine::init(DEFAULT_STACK_SIZE_BYTES))
    }

    fn init(stack_size_bytes: usize) -> Self {
        let stack_kib = stack_size_bytes / 1024;
        let unrecognized = deno_core::v8_set_flags(vec![
            "codemux".to_string(),
            format!("--stack-size={stack_kib}"),
        ]);
        // The first entry is the program name placeholder.
        if unrecognized.len() > 1 {
            tracing::warn!(flags = ?&unrecognized[1..], "V8 rejected engine flags");
        }
        tracing::info!(stack_kib, "sandbox engine initialized");
        Self { stack_size_bytes }
    }

    /// The stack cap applied to every isolate.
    pub fn stack_size_bytes(&self) -> usize {
        self.stack_size_bytes
    }

    /// Create a fresh runtime. This is the only way to obtain a [`SandboxRuntime`].
    pub fn create_runtime(&self, limits: RuntimeLimits) -> Result<SandboxRuntime, SandboxError> {
        if limits.stack_size_bytes != self.stack_size_bytes {
            return Err(SandboxError::InvalidLimits(format!(
                "stack size is fixed at {} bytes for this process (requested {})",
                self.stack_size_bytes, limits.stack_size_bytes
            )));
        }
        if limits.memory_limit_bytes == 0 {
            return Err(SandboxError::InvalidLimits(
                "memory limit must be greater than 0".into(),
            ));
        }
        SandboxRuntime::new(limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_is_a_singleton() {
        let a = Engine::get() as *const Engine;
        let b = Engine::get() as *const Engine;
        assert_eq!(a, b);
        assert_eq!(Engine::get().stack_size_bytes(), 512 * 1024);
    }

    #[test]
    fn stack_override_is_rejected() {
        let err = Engine::get()
            .create_runtime(RuntimeLimits {
                stack_size_bytes: 4 * 1024 * 1024,
                ..Default::default()
            })
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::InvalidLimits(_)), "got: {err:?}");
    }

    #[test]
    fn default_limits_are_the_safety_floor() {
        let limits = RuntimeLimits::default();
        assert_eq!(limits.memory_limit_bytes, 32 * 1024 * 1024);
        assert_eq!(limits.stack_size_bytes, 512 * 1024);
    }
}
