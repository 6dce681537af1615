//! Process-wide Prometheus metrics
//!
//! Metrics here are registered once on the default registry. Metrics that
//! belong to a single client (health checks, cache sizes) live on the
//! client's own registry instead, see [`crate::client::Client::registry`].

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Encoder, Gauge, Histogram, HistogramVec, IntCounter,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    // === Connection pool ===

    /// 1 when the per-connection statement cache is enabled
    pub static ref STATEMENT_CACHE_ENABLED: Gauge = register_gauge!(
        "promstore_statement_cache_enabled",
        "Whether the per-connection prepared statement cache is enabled"
    ).unwrap();

    /// Configured statements per connection
    pub static ref STATEMENT_CACHE_CAPACITY: Gauge = register_gauge!(
        "promstore_statement_cache_per_connection_capacity",
        "Maximum number of statements in the per-connection statement cache"
    ).unwrap();

    // === Store handles ===

    /// Store calls by handle role and operation
    pub static ref STORE_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "promstore_store_requests_total",
        "Store calls by connection role and operation",
        &["role", "op"]
    ).unwrap();

    /// Failed store calls by handle role and operation
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "promstore_store_errors_total",
        "Failed store calls by connection role and operation",
        &["role", "op"]
    ).unwrap();

    /// Store call latency
    pub static ref STORE_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "promstore_store_request_duration_seconds",
        "Store call latency in seconds",
        &["role", "op"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // === Ingestion ===

    /// Samples committed to the store
    pub static ref SAMPLES_INGESTED_TOTAL: IntCounter = register_int_counter!(
        "promstore_ingest_samples_total",
        "Samples committed to the store"
    ).unwrap();

    /// Spans committed to the store
    pub static ref SPANS_INGESTED_TOTAL: IntCounter = register_int_counter!(
        "promstore_ingest_spans_total",
        "Spans committed to the store"
    ).unwrap();

    /// Samples skipped because their chunk is compressed
    pub static ref SAMPLES_SKIPPED_COMPRESSED_TOTAL: IntCounter = register_int_counter!(
        "promstore_ingest_samples_skipped_compressed_total",
        "Samples skipped because they targeted a compressed chunk"
    ).unwrap();

    /// Copy worker failures
    pub static ref COPY_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "promstore_ingest_copy_errors_total",
        "Copy worker failures"
    ).unwrap();

    /// End-to-end ingest call latency
    pub static ref INGEST_DURATION: Histogram = register_histogram!(
        "promstore_ingest_duration_seconds",
        "Ingest call latency in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();
}

/// Statement cache occupancy, registered when a client initializes its metrics
static STATEMENT_CACHE_LEN: OnceLock<Histogram> = OnceLock::new();

/// Record whether the statement cache is on and its capacity
pub fn set_statement_cache_state(enabled: bool, capacity: usize) {
    STATEMENT_CACHE_ENABLED.set(if enabled { 1.0 } else { 0.0 });
    STATEMENT_CACHE_CAPACITY.set(if enabled { capacity as f64 } else { 0.0 });
}

/// Register the statement cache occupancy histogram
///
/// Safe to call repeatedly; only the first call registers.
pub fn init_statement_cache_metrics() {
    if STATEMENT_CACHE_LEN.get().is_some() {
        return;
    }
    match register_histogram!(
        "promstore_statement_cache_elements",
        "Statements held in a connection's cache when it is returned to the pool",
        vec![0.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0]
    ) {
        Ok(histogram) => {
            let _ = STATEMENT_CACHE_LEN.set(histogram);
        },
        Err(e) => warn!(error = %e, "failed to register statement cache histogram"),
    }
}

/// Sample one connection's statement cache size
///
/// Connections can be released before any client has registered the
/// histogram; those samples are dropped.
pub fn observe_statement_cache_len(len: usize) {
    if let Some(histogram) = STATEMENT_CACHE_LEN.get() {
        histogram.observe(len as f64);
    }
}

/// Gather all metrics from the default registry in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Encode a registry in Prometheus text format
pub fn encode_registry(registry: &prometheus::Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_before_init_is_noop() {
        // Must not panic regardless of whether another test initialized it
        observe_statement_cache_len(12);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_statement_cache_metrics();
        init_statement_cache_metrics();
        observe_statement_cache_len(3);
        assert!(STATEMENT_CACHE_LEN.get().is_some());
    }

    #[test]
    fn test_disabled_cache_reports_zero_capacity() {
        set_statement_cache_state(false, 512);
        assert_eq!(STATEMENT_CACHE_ENABLED.get(), 0.0);
        assert_eq!(STATEMENT_CACHE_CAPACITY.get(), 0.0);
    }

    #[test]
    fn test_gather_contains_registered_metrics() {
        SAMPLES_INGESTED_TOTAL.inc_by(0);
        assert!(gather_metrics().contains("promstore_ingest_samples_total"));
    }
}
