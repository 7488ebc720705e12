//! Prometheus metrics for the codemux sandbox.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
    /// "ok" or "error".
    pub outcome: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// [`crate::SandboxError::kind`] of the failure.
    pub error_kind: String,
}

/// Prometheus metrics for `run_code`.
pub struct SandboxMetrics {
    /// Total number of executions by outcome.
    pub executions_total: Family<ExecutionLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Family<ExecutionLabels, Histogram>,
    /// Total number of failed executions by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "codemux_sandbox_executions_total",
            "Total sandbox executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<ExecutionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0].into_iter(),
                )
            });
        registry.register(
            "codemux_sandbox_execution_duration_seconds",
            "Sandbox execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "codemux_sandbox_errors_total",
            "Failed sandbox executions by kind",
            errors_total.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
        }
    }

    /// Record a finished execution. `error_kind` is `None` on success.
    pub fn record_execution(&self, error_kind: Option<&str>, duration_secs: f64) {
        let labels = ExecutionLabels {
            outcome: if error_kind.is_some() { "error" } else { "ok" }.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
        if let Some(kind) = error_kind {
            self.errors_total
                .get_or_create(&ErrorLabels {
                    error_kind: kind.to_string(),
                })
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn outcomes_are_counted_separately() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_execution(None, 0.5);
        metrics.record_execution(None, 1.0);
        metrics.record_execution(Some("timeout"), 0.05);

        let ok = ExecutionLabels {
            outcome: "ok".into(),
        };
        let error = ExecutionLabels {
            outcome: "error".into(),
        };
        assert_eq!(metrics.executions_total.get_or_create(&ok).get(), 2);
        assert_eq!(metrics.executions_total.get_or_create(&error).get(), 1);
    }

    #[test]
    fn errors_are_counted_by_kind() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_execution(Some("timeout"), 0.1);
        metrics.record_execution(Some("timeout"), 0.1);
        metrics.record_execution(Some("js_error"), 0.1);

        let labels = ErrorLabels {
            error_kind: "timeout".into(),
        };
        assert_eq!(metrics.errors_total.get_or_create(&labels).get(), 2);
    }

    #[test]
    fn metrics_encode_to_text() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_execution(Some("invalid_export"), 0.01);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("codemux_sandbox_executions_total"), "{buf}");
        assert!(buf.contains("error_kind=\"invalid_export\""), "{buf}");
    }
}
