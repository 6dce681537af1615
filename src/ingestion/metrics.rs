//! Ingestion-specific metrics collection
//!
//! Per-coordinator counters, complementing the process-wide Prometheus
//! metrics in [`crate::metrics`].

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntGauge, Opts};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ingestion metrics collector
///
/// Thread-safe; uses atomic operations for lock-free updates.
pub struct IngestionMetrics {
    // === Throughput Counters ===
    /// Samples received in write requests
    samples_received: AtomicU64,
    /// Samples committed to the store
    samples_written: AtomicU64,
    /// Samples skipped (compressed chunks, invalid series)
    samples_rejected: AtomicU64,
    /// Spans committed to the store
    spans_written: AtomicU64,

    // === Batch Metrics ===
    /// Write requests accepted
    batches: AtomicU64,
    /// Worker copy operations issued
    copies: AtomicU64,
    /// Worker copy failures
    copy_errors: AtomicU64,

    // === Latency Tracking (simple average) ===
    /// Sum of copy latencies in microseconds
    copy_latency_sum_us: AtomicU64,
    /// Count of copy latency samples
    copy_latency_count: AtomicU64,

    // === Timing ===
    /// When metrics collection started
    start_time: Instant,
}

impl IngestionMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_written: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            spans_written: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            copies: AtomicU64::new(0),
            copy_errors: AtomicU64::new(0),
            copy_latency_sum_us: AtomicU64::new(0),
            copy_latency_count: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an accepted write request
    pub fn record_batch(&self, samples: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.samples_received.fetch_add(samples, Ordering::Relaxed);
    }

    /// Record a successful copy
    pub fn record_copy(&self, written: u64, skipped: u64, latency: Duration) {
        self.copies.fetch_add(1, Ordering::Relaxed);
        self.samples_written.fetch_add(written, Ordering::Relaxed);
        self.samples_rejected.fetch_add(skipped, Ordering::Relaxed);
        self.copy_latency_sum_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.copy_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed copy
    pub fn record_copy_error(&self) {
        self.copies.fetch_add(1, Ordering::Relaxed);
        self.copy_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record samples rejected before reaching a worker
    pub fn record_rejected(&self, samples: u64) {
        self.samples_rejected.fetch_add(samples, Ordering::Relaxed);
    }

    /// Record committed spans
    pub fn record_spans(&self, spans: u64) {
        self.spans_written.fetch_add(spans, Ordering::Relaxed);
    }

    /// Samples committed so far
    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> IngestionStats {
        let latency_count = self.copy_latency_count.load(Ordering::Relaxed);
        let latency_sum = self.copy_latency_sum_us.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed();
        let written = self.samples_written.load(Ordering::Relaxed);

        IngestionStats {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_written: written,
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            spans_written: self.spans_written.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
            copy_errors: self.copy_errors.load(Ordering::Relaxed),
            avg_copy_latency_us: if latency_count > 0 {
                latency_sum / latency_count
            } else {
                0
            },
            samples_per_second: if elapsed.as_secs_f64() > 0.0 {
                written as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            },
            uptime: elapsed,
        }
    }
}

impl Default for IngestionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of ingestion metrics
#[derive(Debug, Clone, Default)]
pub struct IngestionStats {
    /// Samples received in write requests
    pub samples_received: u64,
    /// Samples committed
    pub samples_written: u64,
    /// Samples rejected or skipped
    pub samples_rejected: u64,
    /// Spans committed
    pub spans_written: u64,
    /// Write requests accepted
    pub batches: u64,
    /// Copy operations issued
    pub copies: u64,
    /// Copy failures
    pub copy_errors: u64,
    /// Average copy latency in microseconds
    pub avg_copy_latency_us: u64,
    /// Committed samples per second since start
    pub samples_per_second: f64,
    /// Time since the collector was created
    pub uptime: Duration,
}

/// Exposes one coordinator's counters on a client registry
pub struct IngestionCollector {
    metrics: Arc<IngestionMetrics>,
    samples_written: IntGauge,
    batches: IntGauge,
    copy_errors: IntGauge,
}

impl IngestionCollector {
    pub fn new(metrics: Arc<IngestionMetrics>) -> prometheus::Result<Self> {
        Ok(Self {
            metrics,
            samples_written: IntGauge::with_opts(Opts::new(
                "promstore_client_samples_written",
                "Samples committed by this client",
            ))?,
            batches: IntGauge::with_opts(Opts::new(
                "promstore_client_batches",
                "Write requests accepted by this client",
            ))?,
            copy_errors: IntGauge::with_opts(Opts::new(
                "promstore_client_copy_errors",
                "Copy worker failures in this client",
            ))?,
        })
    }
}

impl Collector for IngestionCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.samples_written
            .desc()
            .into_iter()
            .chain(self.batches.desc())
            .chain(self.copy_errors.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let stats = self.metrics.snapshot();
        self.samples_written.set(stats.samples_written as i64);
        self.batches.set(stats.batches as i64);
        self.copy_errors.set(stats.copy_errors as i64);
        let mut families = self.samples_written.collect();
        families.extend(self.batches.collect());
        families.extend(self.copy_errors.collect());
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_averages_latency() {
        let metrics = IngestionMetrics::new();
        metrics.record_batch(10);
        metrics.record_copy(6, 1, Duration::from_micros(100));
        metrics.record_copy(3, 0, Duration::from_micros(300));
        metrics.record_copy_error();
        metrics.record_rejected(2);

        let stats = metrics.snapshot();
        assert_eq!(stats.samples_received, 10);
        assert_eq!(stats.samples_written, 9);
        assert_eq!(stats.samples_rejected, 3);
        assert_eq!(stats.copies, 3);
        assert_eq!(stats.copy_errors, 1);
        assert_eq!(stats.avg_copy_latency_us, 200);
    }

    #[test]
    fn test_collector_reports_current_counts() {
        let metrics = Arc::new(IngestionMetrics::new());
        let collector = IngestionCollector::new(Arc::clone(&metrics)).unwrap();
        metrics.record_batch(4);
        metrics.record_copy(4, 0, Duration::from_micros(10));

        let registry = prometheus::Registry::new();
        registry.register(Box::new(collector)).unwrap();
        let families = registry.gather();
        let written = families
            .iter()
            .find(|f| f.get_name() == "promstore_client_samples_written")
            .unwrap();
        assert_eq!(written.get_metric()[0].get_gauge().get_value(), 4.0);
    }
}
