//! Prometheus metrics for the load balancer.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for request metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    /// HTTP status code
    pub status: String,
}

/// Labels for rejected requests
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
    /// Reason (busy, degraded, queue_timeout, exhausted)
    pub reason: String,
}

/// Metrics registry with all load balancer metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    /// Requests answered, by status
    requests_total: Family<StatusLabels, Counter>,
    /// Wall time from arrival to response
    request_duration_seconds: Histogram,
    /// Failed forwarding attempts
    upstream_failures_total: Counter,
    /// Requests refused without reaching a worker
    rejections_total: Family<RejectionLabels, Counter>,
    /// Requests admitted and not yet answered
    inflight: Gauge,
    /// Requests waiting in the queue
    queue_depth: Gauge,
    /// Sockets passing their readiness probe
    ready_workers: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<StatusLabels, Counter>::default();
        registry.register(
            "rip_requests_total",
            "Total requests answered",
            requests_total.clone(),
        );

        // Exponential buckets from 0.5ms to ~8s
        let request_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 15));
        registry.register(
            "rip_request_duration_seconds",
            "Request duration in seconds",
            request_duration_seconds.clone(),
        );

        let upstream_failures_total = Counter::default();
        registry.register(
            "rip_upstream_failures_total",
            "Total failed forwarding attempts",
            upstream_failures_total.clone(),
        );

        let rejections_total = Family::<RejectionLabels, Counter>::default();
        registry.register(
            "rip_rejections_total",
            "Total requests rejected by reason",
            rejections_total.clone(),
        );

        let inflight = Gauge::default();
        registry.register("rip_inflight", "Requests in flight", inflight.clone());

        let queue_depth = Gauge::default();
        registry.register("rip_queue_depth", "Queued requests", queue_depth.clone());

        let ready_workers = Gauge::default();
        registry.register(
            "rip_ready_workers",
            "Worker sockets passing readiness probes",
            ready_workers.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            upstream_failures_total,
            rejections_total,
            inflight,
            queue_depth,
            ready_workers,
        }
    }

    /// Record an answered request
    pub fn record_request(&self, status: u16, duration: Duration) {
        self.requests_total
            .get_or_create(&StatusLabels {
                status: status.to_string(),
            })
            .inc();
        self.request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures_total.inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total
            .get_or_create(&RejectionLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn set_inflight(&self, count: usize) {
        self.inflight.set(count as i64);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_ready_workers(&self, count: usize) {
        self.ready_workers.set(count as i64);
    }

    /// Prometheus text exposition
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new();
        let output = registry.encode().unwrap();
        assert!(output.contains("rip_inflight"));
        assert!(output.contains("rip_ready_workers"));
    }

    #[test]
    fn test_record_request_and_rejection() {
        let registry = MetricsRegistry::new();
        registry.record_request(200, Duration::from_millis(12));
        registry.record_request(503, Duration::from_millis(1));
        registry.record_rejection("busy");
        registry.record_upstream_failure();

        let output = registry.encode().unwrap();
        assert!(output.contains("rip_requests_total{status=\"200\"} 1"));
        assert!(output.contains("rip_rejections_total{reason=\"busy\"} 1"));
        assert!(output.contains("rip_upstream_failures_total 1"));
    }

    #[test]
    fn test_gauges() {
        let registry = MetricsRegistry::new();
        registry.set_inflight(3);
        registry.set_queue_depth(7);
        registry.set_ready_workers(2);

        let output = registry.encode().unwrap();
        assert!(output.contains("rip_inflight 3"));
        assert!(output.contains("rip_queue_depth 7"));
        assert!(output.contains("rip_ready_workers 2"));
    }
}
