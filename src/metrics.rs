//! Prometheus metrics collection and export.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;

/// Labels for gateway request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// HTTP status code written back (200, 404, etc.)
    pub status: String,
    /// Service key of the request
    pub service: String,
}

/// Labels for per-service counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

/// Metrics collector for the gateway.
///
/// One instance is shared by the filters and the admin endpoint.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<RequestLabels, Histogram>,
    retries_total: Family<ServiceLabels, Counter>,
    rejected_total: Counter,
}

impl Metrics {
    /// Creates and registers every metric.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gateway_requests",
            "Total number of requests handled by the gateway",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 12))
            });
        registry.register(
            "gateway_request_duration_seconds",
            "Request latency from intake to response in seconds",
            request_duration_seconds.clone(),
        );

        let retries_total = Family::<ServiceLabels, Counter>::default();
        registry.register(
            "gateway_retries",
            "Outbound calls retried after a transport failure",
            retries_total.clone(),
        );

        let rejected_total = Counter::default();
        registry.register(
            "gateway_rejected",
            "Requests rejected because the dispatch queue was full",
            rejected_total.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            retries_total,
            rejected_total,
        }
    }

    /// Records a finished request.
    pub fn record_request(&self, method: &str, status: u16, service: &str, duration_secs: f64) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
            service: service.to_string(),
        };
        self.requests_total.get_or_create(&labels).inc();
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Counts one retry of a service call.
    pub fn record_retry(&self, service: &str) {
        self.retries_total
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .inc();
    }

    /// Counts one request turned away by the dispatch queue.
    pub fn record_rejected(&self) {
        self.rejected_total.inc();
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, io::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
