//! Async pump: drives the isolate's job queue while the host awaits a result.
//!
//! V8 promises only settle when the runtime's microtasks and completed ops
//! are processed, and that only happens when someone polls the event loop.
//! The pump is a plain polling loop with a bounded interval and an explicit
//! deadline, so a pending promise can never stall the host forever.

use std::future::{poll_fn, Future};
use std::pin::pin;
use std::task::Poll;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions};
use thiserror::Error;

/// Sleep between two pump iterations.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Why the pump stopped without a value.
#[derive(Debug, Error)]
pub enum PumpError {
    /// The deadline passed before the value settled.
    #[error("timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// A job or op failed while the event loop was polled.
    #[error("{0}")]
    EventLoop(String),

    /// The awaited promise rejected.
    #[error("{0}")]
    Rejected(String),
}

/// Poll `future` to completion, pumping the event loop between polls.
///
/// Each iteration polls the event loop once (running microtasks and settling
/// completed ops, propagating their errors), polls `future` once, checks the
/// elapsed time against `timeout`, then sleeps for [`POLL_INTERVAL`].
pub async fn drive_with_job_pump<F>(
    js: &mut JsRuntime,
    future: F,
    timeout: Duration,
) -> Result<F::Output, PumpError>
where
    F: Future,
{
    let started = Instant::now();
    let mut future = pin!(future);
    loop {
        let (event_loop, settled) = poll_fn(|cx| {
            let event_loop = js.poll_event_loop(cx, PollEventLoopOptions::default());
            let settled = future.as_mut().poll(cx);
            Poll::Ready((event_loop, settled))
        })
        .await;

        if let Poll::Ready(Err(e)) = event_loop {
            return Err(PumpError::EventLoop(e.to_string()));
        }
        if let Poll::Ready(output) = settled {
            return Ok(output);
        }
        if started.elapsed() >= timeout {
            return Err(PumpError::TimedOut(timeout));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Resolve a VM value that may be a promise. Non-promise values resolve
/// immediately; a rejection surfaces as [`PumpError::Rejected`].
pub async fn resolve_promise_with_job_pump(
    js: &mut JsRuntime,
    value: v8::Global<v8::Value>,
    timeout: Duration,
) -> Result<v8::Global<v8::Value>, PumpError> {
    let settled = js.resolve(value);
    drive_with_job_pump(js, settled, timeout)
        .await?
        .map_err(|e| PumpError::Rejected(e.to_string()))
}

/// Give trailing microtasks and completed ops one more turn.
pub async fn drain_pending_jobs(js: &mut JsRuntime) -> Result<(), PumpError> {
    let polled = poll_fn(|cx| Poll::Ready(js.poll_event_loop(cx, PollEventLoopOptions::default())))
        .await;
    match polled {
        Poll::Ready(Err(e)) => Err(PumpError::EventLoop(e.to_string())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deno_core::RuntimeOptions;

    fn test_runtime() -> JsRuntime {
        crate::Engine::get();
        JsRuntime::new(RuntimeOptions::default())
    }

    fn number(js: &mut JsRuntime, value: &v8::Global<v8::Value>) -> f64 {
        let scope = &mut js.handle_scope();
        let local = v8::Local::new(scope, value);
        local.number_value(scope).unwrap()
    }

    #[tokio::test]
    async fn plain_values_resolve_immediately() {
        let mut js = test_runtime();
        let value = js.execute_script("[test]", "41 + 1").unwrap();
        let resolved = resolve_promise_with_job_pump(&mut js, value, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(number(&mut js, &resolved), 42.0);
    }

    #[tokio::test]
    async fn promise_chains_settle_through_the_pump() {
        let mut js = test_runtime();
        let value = js
            .execute_script(
                "[test]",
                "(async () => { let n = 0; for (let i = 0; i < 5; i++) { n += await Promise.resolve(i); } return n; })()",
            )
            .unwrap();
        let resolved = resolve_promise_with_job_pump(&mut js, value, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(number(&mut js, &resolved), 10.0);
    }

    #[tokio::test]
    async fn rejection_is_reported() {
        let mut js = test_runtime();
        let value = js
            .execute_script("[test]", "Promise.reject(new Error('nope'))")
            .unwrap();
        let err = resolve_promise_with_job_pump(&mut js, value, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PumpError::Rejected(ref m) if m.contains("nope")), "got: {err:?}");
    }

    #[tokio::test]
    async fn never_settling_promise_times_out() {
        let mut js = test_runtime();
        let value = js.execute_script("[test]", "new Promise(() => {})").unwrap();
        let started = Instant::now();
        let err = resolve_promise_with_job_pump(&mut js, value, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, PumpError::TimedOut(_)), "got: {err:?}");
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
