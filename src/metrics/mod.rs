//! Metrics and monitoring using Prometheus.
//!
//! Exposed on the `/metrics` endpoint of the metrics server:
//!
//! - **Counters**: messages published, pulled, acknowledged, requeued and
//!   dropped; handler failures; tasks created; backend errors; gateway requests
//! - **Histograms**: handler latency and backend call latency

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::error;

/// Global metrics registry
static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Global metrics instance
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    let metrics = Metrics::new();
    if let Err(e) = metrics.register(&METRICS_REGISTRY) {
        error!("Failed to register metrics: {}", e);
    }
    Arc::new(metrics)
});

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Metrics collector for qbridge
pub struct Metrics {
    /// Messages published to topics (counter)
    pub messages_published_total: IntCounterVec,
    /// Messages pulled from subscriptions (counter)
    pub messages_pulled_total: IntCounterVec,
    /// Messages acknowledged (counter)
    pub messages_acknowledged_total: IntCounterVec,
    /// Messages re-published after a handler failure (counter)
    pub messages_requeued_total: IntCounterVec,
    /// Messages dropped without reaching a handler (counter)
    pub messages_dropped_total: IntCounterVec,
    /// Handler invocations that failed (counter)
    pub handler_failures_total: IntCounterVec,
    /// Tasks created in task queues (counter)
    pub tasks_created_total: IntCounterVec,
    /// Backend errors encountered (counter)
    pub backend_errors_total: IntCounterVec,
    /// Gateway HTTP requests (counter)
    pub api_requests_total: IntCounterVec,

    /// Handler latency in seconds (histogram)
    pub handler_latency_seconds: HistogramVec,
    /// Backend call latency in seconds (histogram)
    pub backend_latency_seconds: HistogramVec,
}

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|e| panic!("Failed to create {} metric: {}", name, e))
}

fn histogram(name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    HistogramVec::new(
        HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
        labels,
    )
    .unwrap_or_else(|e| panic!("Failed to create {} metric: {}", name, e))
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self {
            messages_published_total: counter(
                "qbridge_messages_published_total",
                "Total messages published to topics",
                &["topic"],
            ),
            messages_pulled_total: counter(
                "qbridge_messages_pulled_total",
                "Total messages pulled from subscriptions",
                &["subscription"],
            ),
            messages_acknowledged_total: counter(
                "qbridge_messages_acknowledged_total",
                "Total messages acknowledged",
                &["subscription"],
            ),
            messages_requeued_total: counter(
                "qbridge_messages_requeued_total",
                "Total messages requeued after a handler failure",
                &["subscription"],
            ),
            messages_dropped_total: counter(
                "qbridge_messages_dropped_total",
                "Total messages dropped before reaching a handler",
                &["delivery", "reason"],
            ),
            handler_failures_total: counter(
                "qbridge_handler_failures_total",
                "Total failed handler invocations",
                &["delivery"],
            ),
            tasks_created_total: counter(
                "qbridge_tasks_created_total",
                "Total tasks created",
                &["queue"],
            ),
            backend_errors_total: counter(
                "qbridge_backend_errors_total",
                "Total backend errors",
                &["operation"],
            ),
            api_requests_total: counter(
                "qbridge_api_requests_total",
                "Total gateway API requests",
                &["endpoint", "status"],
            ),
            handler_latency_seconds: histogram(
                "qbridge_handler_latency_seconds",
                "Handler latency in seconds",
                &["delivery"],
            ),
            backend_latency_seconds: histogram(
                "qbridge_backend_latency_seconds",
                "Backend call latency in seconds",
                &["operation"],
            ),
        }
    }

    /// Register all metrics with the registry
    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.messages_published_total.clone()))?;
        registry.register(Box::new(self.messages_pulled_total.clone()))?;
        registry.register(Box::new(self.messages_acknowledged_total.clone()))?;
        registry.register(Box::new(self.messages_requeued_total.clone()))?;
        registry.register(Box::new(self.messages_dropped_total.clone()))?;
        registry.register(Box::new(self.handler_failures_total.clone()))?;
        registry.register(Box::new(self.tasks_created_total.clone()))?;
        registry.register(Box::new(self.backend_errors_total.clone()))?;
        registry.register(Box::new(self.api_requests_total.clone()))?;
        registry.register(Box::new(self.handler_latency_seconds.clone()))?;
        registry.register(Box::new(self.backend_latency_seconds.clone()))?;
        Ok(())
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = METRICS_REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics instance
pub fn get_metrics() -> Arc<Metrics> {
    METRICS.clone()
}

/// Count `err` against `operation` when it came from the backend.
pub fn record_backend_error(operation: &str, err: &crate::Error) {
    if err.is_backend() {
        METRICS
            .backend_errors_total
            .with_label_values(&[operation])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        metrics
            .messages_published_total
            .with_label_values(&["projects/p/topics/t"])
            .inc();
    }

    #[test]
    fn test_global_metrics_lazy_initialization() {
        let metrics1 = get_metrics();
        let metrics2 = get_metrics();
        assert!(Arc::ptr_eq(&metrics1, &metrics2));
    }

    #[test]
    fn test_metrics_gather() {
        let metrics = get_metrics();
        metrics
            .messages_requeued_total
            .with_label_values(&["projects/p/subscriptions/s"])
            .inc();
        metrics
            .handler_latency_seconds
            .with_label_values(&["pull"])
            .observe(0.02);

        let output = metrics.gather().expect("Failed to gather metrics");
        assert!(output.contains("qbridge_messages_requeued_total"));
        assert!(output.contains("qbridge_handler_latency_seconds"));
    }
}
