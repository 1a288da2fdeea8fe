//! Prometheus metrics collection and export.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels for mesh call metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallLabels {
    /// Target service name
    pub service: String,
    /// Call outcome ("success", "error", "rejected")
    pub outcome: String,
}

/// Global metrics registry.
///
/// Initialized once at startup and shared across all meshes in the
/// process; the external observability layer scrapes it through
/// [`Metrics::encode`].
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for mesh calls.
pub struct Metrics {
    registry: Registry,
    calls_total: Family<CallLabels, Counter>,
    call_duration_seconds: Family<CallLabels, Histogram>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let calls_total = Family::<CallLabels, Counter>::default();
        registry.register(
            "mesh_calls_total",
            "Total number of mesh calls",
            calls_total.clone(),
        );

        let call_duration_seconds = Family::<CallLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 12))
        });
        registry.register(
            "mesh_call_duration_seconds",
            "Mesh call latency in seconds",
            call_duration_seconds.clone(),
        );

        Self {
            registry,
            calls_total,
            call_duration_seconds,
        }
    }

    /// Records one mesh call with its outcome and duration.
    pub fn record_call(service: &str, outcome: &str, duration_secs: f64) {
        let labels = CallLabels {
            service: service.to_string(),
            outcome: outcome.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.calls_total.get_or_create(&labels).inc();
            metrics
                .call_duration_seconds
                .get_or_create(&labels)
                .observe(duration_secs);
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_call() {
        Metrics::record_call("payments", "success", 0.05);
        Metrics::record_call("payments", "error", 0.1);

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("mesh_calls_total"));
        assert!(encoded.contains("mesh_call_duration_seconds"));
    }

    #[test]
    fn test_metrics_encoding() {
        let encoded = Metrics::encode();
        assert!(encoded.is_ok());
    }
}
