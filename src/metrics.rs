//! Prometheus metrics.
//!
//! Counters are partitioned by wire format. Request duration is only
//! recorded for successfully parsed requests; error timings are dominated
//! by how early the failure happens and would skew the histogram.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec, TextEncoder,
};

pub static INGEST_METRICS: Lazy<IngestMetrics> = Lazy::new(IngestMetrics::register);

pub struct IngestMetrics {
    pub requests_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
}

impl IngestMetrics {
    fn register() -> Self {
        Self {
            requests_total: register_int_counter_vec!(
                "tracelake_http_requests_total",
                "Number of OpenTelemetry trace export requests.",
                &["path", "format"]
            )
            .expect("failed to register tracelake_http_requests_total"),
            errors_total: register_int_counter_vec!(
                "tracelake_http_errors_total",
                "Number of failed OpenTelemetry trace export requests.",
                &["path", "format"]
            )
            .expect("failed to register tracelake_http_errors_total"),
            request_duration_seconds: register_histogram_vec!(
                "tracelake_http_request_duration_seconds",
                "Duration of successfully parsed OpenTelemetry trace export requests.",
                &["path", "format"]
            )
            .expect("failed to register tracelake_http_request_duration_seconds"),
        }
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to encode metrics");
            String::new()
        })
}
