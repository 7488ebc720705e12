//! Prometheus metrics for the access-controlled invoker.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Labels for the call counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallLabels {
    /// Connection id.
    pub connection: String,
    /// Tool name.
    pub tool: String,
    /// "success" or "error".
    pub outcome: String,
}

/// Labels for the duration histogram.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ToolLabels {
    /// Connection id.
    pub connection: String,
    /// Tool name.
    pub tool: String,
}

/// Per-attempt invoker metrics, shared by the ordinary and streaming paths.
pub struct InvokerMetrics {
    /// Calls by connection, tool and outcome.
    pub calls_total: Family<CallLabels, Counter>,
    /// Call duration in seconds by connection and tool.
    pub call_duration_seconds: Family<ToolLabels, Histogram>,
}

impl InvokerMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let calls_total = Family::default();
        registry.register(
            "codemux_invoker_calls_total",
            "Tool calls through the access-controlled invoker",
            calls_total.clone(),
        );

        let call_duration_seconds = Family::<ToolLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0].into_iter())
        });
        registry.register(
            "codemux_invoker_call_duration_seconds",
            "Tool call duration",
            call_duration_seconds.clone(),
        );

        Self {
            calls_total,
            call_duration_seconds,
        }
    }

    /// Record one attempt.
    pub fn record_call(&self, connection: &str, tool: &str, success: bool, duration_secs: f64) {
        self.calls_total
            .get_or_create(&CallLabels {
                connection: connection.to_string(),
                tool: tool.to_string(),
                outcome: if success { "success" } else { "error" }.to_string(),
            })
            .inc();
        self.call_duration_seconds
            .get_or_create(&ToolLabels {
                connection: connection.to_string(),
                tool: tool.to_string(),
            })
            .observe(duration_secs);
    }

    /// Count of recorded attempts for one label set.
    pub fn calls(&self, connection: &str, tool: &str, success: bool) -> u64 {
        self.calls_total
            .get_or_create(&CallLabels {
                connection: connection.to_string(),
                tool: tool.to_string(),
                outcome: if success { "success" } else { "error" }.to_string(),
            })
            .get()
    }
}
