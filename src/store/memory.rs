//! In-memory store
//!
//! A [`Store`] that keeps everything in process memory. It models the parts
//! of the relational backend the coordination layer depends on:
//!
//! - idempotent identifier assignment for metrics, labels, series and
//!   exemplar key positions
//! - time-bucketed chunks that can be compressed (made read-only)
//! - a bounded number of "connections" with an acquire timeout
//! - a reachability toggle for health check tests
//!
//! # Warning
//!
//! Not suitable for production: all data is lost on drop.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use super::{
    CopyBatch, CopyReport, DatabaseStats, ExemplarRow, SeriesSelector, Store,
};
use crate::error::StoreError;
use crate::telemetry::TelemetryReport;
use crate::types::{
    Label, LabelId, Labels, MetricId, Sample, SeriesId, Span, TimeSeries, TraceBatch,
};

/// Default chunk width: eight hours
pub const DEFAULT_CHUNK_INTERVAL_MS: i64 = 8 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ChunkTable {
    Sample,
    Exemplar,
    Span,
}

impl ChunkTable {
    fn as_str(&self) -> &'static str {
        match self {
            ChunkTable::Sample => "sample",
            ChunkTable::Exemplar => "exemplar",
            ChunkTable::Span => "span",
        }
    }
}

#[derive(Debug, Default)]
struct Chunk {
    compressed: bool,
}

#[derive(Debug, Default)]
struct SeriesEntry {
    label_ids: Vec<LabelId>,
    samples: Vec<Sample>,
    exemplars: Vec<ExemplarRow>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    metrics: HashMap<String, MetricId>,
    labels: HashMap<Label, LabelId>,
    labels_by_id: HashMap<LabelId, Label>,
    series_keys: HashMap<(MetricId, Vec<LabelId>), SeriesId>,
    series: BTreeMap<SeriesId, SeriesEntry>,
    exemplar_positions: HashMap<String, HashMap<String, usize>>,
    chunks: HashMap<(ChunkTable, i64), Chunk>,
    spans: Vec<Span>,
    series_epoch: i64,
    telemetry: Vec<TelemetryReport>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_compressed(&self, key: (ChunkTable, i64)) -> bool {
        self.chunks.get(&key).map(|c| c.compressed).unwrap_or(false)
    }
}

/// Number of store calls by kind, for asserting cache effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `get_or_create_metric` calls
    pub metric: u64,
    /// `get_or_create_labels` and `lookup_labels` calls
    pub labels: u64,
    /// `get_or_create_series` calls
    pub series: u64,
    /// `get_or_create_exemplar_positions` calls
    pub exemplar_positions: u64,
    /// `copy` calls
    pub copies: u64,
    /// `ping` calls
    pub pings: u64,
}

#[derive(Default)]
struct Calls {
    metric: AtomicU64,
    labels: AtomicU64,
    series: AtomicU64,
    exemplar_positions: AtomicU64,
    copies: AtomicU64,
    pings: AtomicU64,
}

/// In-memory [`Store`]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    /// Simulated pool connections
    connections: Semaphore,
    max_connections: usize,
    acquire_timeout: Duration,
    copy_latency: Duration,
    chunk_interval_ms: i64,
    compression_enabled: bool,
    maintenance_jobs: u64,
    telemetry_supported: bool,
    unreachable: AtomicBool,
    closed: AtomicBool,
    calls: Calls,
    /// Background-visible operations in the order they ran
    journal: Mutex<Vec<&'static str>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with ten connections, compression and two maintenance jobs
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            connections: Semaphore::new(10),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            copy_latency: Duration::ZERO,
            chunk_interval_ms: DEFAULT_CHUNK_INTERVAL_MS,
            compression_enabled: true,
            maintenance_jobs: 2,
            telemetry_supported: true,
            unreachable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            calls: Calls::default(),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Limit concurrent operations, like a pool's `max_connections`
    pub fn with_max_connections(mut self, max: usize) -> Self {
        let max = max.max(1);
        self.connections = Semaphore::new(max);
        self.max_connections = max;
        self
    }

    /// How long an operation waits for a free connection
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Hold the connection this long during every copy
    pub fn with_copy_latency(mut self, latency: Duration) -> Self {
        self.copy_latency = latency;
        self
    }

    /// Chunk width in milliseconds
    pub fn with_chunk_interval_ms(mut self, interval_ms: i64) -> Self {
        self.chunk_interval_ms = interval_ms.max(1);
        self
    }

    /// Whether compression is reported as available
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Number of maintenance jobs reported in stats
    pub fn with_maintenance_jobs(mut self, jobs: u64) -> Self {
        self.maintenance_jobs = jobs;
        self
    }

    /// Whether telemetry reports can be stored
    pub fn with_telemetry(mut self, supported: bool) -> Self {
        self.telemetry_supported = supported;
        self
    }

    // =========================================================================
    // Test hooks
    // =========================================================================

    /// `ping`, `series_epoch`, `write_telemetry`, completed `copy` and `close`
    /// calls in the order they happened
    pub fn journal(&self) -> Vec<&'static str> {
        self.journal.lock().clone()
    }

    fn record(&self, op: &'static str) {
        self.journal.lock().push(op);
    }

    /// Make every operation fail as if the network were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Compress the sample chunk covering `timestamp_ms`, returning its name
    pub fn compress_chunk_containing(&self, timestamp_ms: i64) -> String {
        self.compress(ChunkTable::Sample, timestamp_ms)
    }

    /// Compress the exemplar chunk covering `timestamp_ms`
    pub fn compress_exemplar_chunk_containing(&self, timestamp_ms: i64) -> String {
        self.compress(ChunkTable::Exemplar, timestamp_ms)
    }

    /// Compress the span chunk covering `timestamp_ms`
    pub fn compress_span_chunk_containing(&self, timestamp_ms: i64) -> String {
        self.compress(ChunkTable::Span, timestamp_ms)
    }

    fn compress(&self, table: ChunkTable, timestamp_ms: i64) -> String {
        let bucket = self.bucket(timestamp_ms);
        self.state
            .lock()
            .chunks
            .entry((table, bucket))
            .or_default()
            .compressed = true;
        chunk_name(table, bucket)
    }

    /// Signal that series ids may have been recycled
    pub fn bump_series_epoch(&self) {
        self.state.lock().series_epoch += 1;
    }

    /// Stored samples of the series with these labels, empty if unknown
    pub fn samples(&self, labels: &Labels) -> Vec<Sample> {
        let state = self.state.lock();
        let ids: Option<Vec<LabelId>> = labels
            .iter()
            .map(|l| state.labels.get(l).copied())
            .collect();
        let (Some(ids), Some(name)) = (ids, labels.metric_name()) else {
            return Vec::new();
        };
        let Some(metric) = state.metrics.get(name) else {
            return Vec::new();
        };
        state
            .series_keys
            .get(&(*metric, ids))
            .and_then(|id| state.series.get(id))
            .map(|s| s.samples.clone())
            .unwrap_or_default()
    }

    /// Exemplar rows stored for the series with this id
    pub fn exemplars(&self, series_id: SeriesId) -> Vec<ExemplarRow> {
        self.state
            .lock()
            .series
            .get(&series_id)
            .map(|s| s.exemplars.clone())
            .unwrap_or_default()
    }

    /// Number of spans stored
    pub fn span_count(&self) -> usize {
        self.state.lock().spans.len()
    }

    /// Number of series stored
    pub fn series_count(&self) -> usize {
        self.state.lock().series.len()
    }

    /// Telemetry reports written so far
    pub fn telemetry_reports(&self) -> Vec<TelemetryReport> {
        self.state.lock().telemetry.clone()
    }

    /// Store calls made so far
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            metric: self.calls.metric.load(Ordering::Relaxed),
            labels: self.calls.labels.load(Ordering::Relaxed),
            series: self.calls.series.load(Ordering::Relaxed),
            exemplar_positions: self.calls.exemplar_positions.load(Ordering::Relaxed),
            copies: self.calls.copies.load(Ordering::Relaxed),
            pings: self.calls.pings.load(Ordering::Relaxed),
        }
    }

    /// True once `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Configured connection limit
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn bucket(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.chunk_interval_ms)
    }

    /// First `(table, timestamp)` landing in a compressed chunk, as an error
    fn reject_compressed(
        &self,
        state: &MemoryState,
        keys: impl IntoIterator<Item = (ChunkTable, i64)>,
    ) -> Result<(), StoreError> {
        for (table, ts) in keys {
            let bucket = self.bucket(ts);
            if state.is_compressed((table, bucket)) {
                return Err(StoreError::ChunkCompressed {
                    table: table.as_str().to_string(),
                    chunk: chunk_name(table, bucket),
                });
            }
        }
        Ok(())
    }

    /// Check out a simulated connection
    async fn acquire(&self) -> Result<SemaphorePermit<'_>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("connection refused".to_string()));
        }
        match tokio::time::timeout(self.acquire_timeout, self.connections.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(StoreError::Closed),
            Err(_) => Err(StoreError::PoolTimeout),
        }
    }
}

fn spans(batch: &TraceBatch) -> impl Iterator<Item = &Span> {
    batch.resource_spans.iter().flat_map(|rs| rs.spans.iter())
}

fn chunk_name(table: ChunkTable, bucket: i64) -> String {
    format!("_{}_chunk_{}", table.as_str(), bucket)
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.calls.pings.fetch_add(1, Ordering::Relaxed);
        self.record("ping");
        let _conn = self.acquire().await?;
        Ok(())
    }

    async fn get_or_create_metric(&self, name: &str) -> Result<MetricId, StoreError> {
        self.calls.metric.fetch_add(1, Ordering::Relaxed);
        let _conn = self.acquire().await?;
        let mut state = self.state.lock();
        if let Some(id) = state.metrics.get(name) {
            return Ok(*id);
        }
        let id = state.next_id();
        state.metrics.insert(name.to_string(), id);
        Ok(id)
    }

    async fn get_or_create_labels(&self, labels: &[Label]) -> Result<Vec<LabelId>, StoreError> {
        self.calls.labels.fetch_add(1, Ordering::Relaxed);
        let _conn = self.acquire().await?;
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(labels.len());
        for label in labels {
            let id = match state.labels.get(label) {
                Some(id) => *id,
                None => {
                    let id = state.next_id();
                    state.labels.insert(label.clone(), id);
                    state.labels_by_id.insert(id, label.clone());
                    id
                },
            };
            ids.push(id);
        }
        Ok(ids)
    }

    async fn lookup_labels(&self, labels: &[Label]) -> Result<Vec<Option<LabelId>>, StoreError> {
        self.calls.labels.fetch_add(1, Ordering::Relaxed);
        let _conn = self.acquire().await?;
        let state = self.state.lock();
        Ok(labels.iter().map(|l| state.labels.get(l).copied()).collect())
    }

    async fn get_or_create_series(
        &self,
        metric: MetricId,
        label_ids: &[LabelId],
    ) -> Result<SeriesId, StoreError> {
        self.calls.series.fetch_add(1, Ordering::Relaxed);
        let _conn = self.acquire().await?;
        let mut state = self.state.lock();
        let key = (metric, label_ids.to_vec());
        if let Some(id) = state.series_keys.get(&key) {
            return Ok(*id);
        }
        let id = state.next_id();
        state.series_keys.insert(key, id);
        state.series.insert(
            id,
            SeriesEntry {
                label_ids: label_ids.to_vec(),
                ..SeriesEntry::default()
            },
        );
        Ok(id)
    }

    async fn get_or_create_exemplar_positions(
        &self,
        metric: &str,
        keys: &[String],
    ) -> Result<HashMap<String, usize>, StoreError> {
        self.calls.exemplar_positions.fetch_add(1, Ordering::Relaxed);
        let _conn = self.acquire().await?;
        let mut state = self.state.lock();
        let positions = state.exemplar_positions.entry(metric.to_string()).or_default();
        for key in keys {
            let next = positions.len();
            positions.entry(key.clone()).or_insert(next);
        }
        Ok(positions.clone())
    }

    async fn copy(
        &self,
        batch: CopyBatch,
        ignore_compressed: bool,
    ) -> Result<CopyReport, StoreError> {
        self.calls.copies.fetch_add(1, Ordering::Relaxed);
        let _conn = self.acquire().await?;
        if !self.copy_latency.is_zero() {
            tokio::time::sleep(self.copy_latency).await;
        }

        let mut state = self.state.lock();

        // The copy is atomic: reject before touching anything
        if let Some(rows) = batch
            .samples
            .iter()
            .find(|rows| !state.series.contains_key(&rows.series_id))
        {
            return Err(StoreError::Query(format!(
                "unknown series id {}",
                rows.series_id
            )));
        }
        if !ignore_compressed {
            let sample_keys = batch
                .samples
                .iter()
                .flat_map(|s| s.samples.iter().map(|p| (ChunkTable::Sample, p.timestamp)));
            let exemplar_keys = batch
                .exemplars
                .iter()
                .map(|e| (ChunkTable::Exemplar, e.timestamp));
            self.reject_compressed(&state, sample_keys.chain(exemplar_keys))?;
        }

        let mut report = CopyReport::default();
        for rows in batch.samples {
            for sample in rows.samples {
                let key = (ChunkTable::Sample, self.bucket(sample.timestamp));
                if state.is_compressed(key) {
                    report.skipped += 1;
                    continue;
                }
                state.chunks.entry(key).or_default();
                if let Some(series) = state.series.get_mut(&rows.series_id) {
                    series.samples.push(sample);
                    report.written += 1;
                }
            }
        }
        for row in batch.exemplars {
            let key = (ChunkTable::Exemplar, self.bucket(row.timestamp));
            if state.is_compressed(key) {
                report.exemplars_skipped += 1;
                continue;
            }
            state.chunks.entry(key).or_default();
            if let Some(series) = state.series.get_mut(&row.series_id) {
                series.exemplars.push(row);
            }
        }

        debug!(
            written = report.written,
            skipped = report.skipped,
            exemplars_skipped = report.exemplars_skipped,
            "memory store copy"
        );
        self.record("copy");
        Ok(report)
    }

    async fn check_writable(
        &self,
        sample_times: &[i64],
        exemplar_times: &[i64],
    ) -> Result<(), StoreError> {
        let _conn = self.acquire().await?;
        let state = self.state.lock();
        let keys = sample_times
            .iter()
            .map(|ts| (ChunkTable::Sample, *ts))
            .chain(exemplar_times.iter().map(|ts| (ChunkTable::Exemplar, *ts)));
        self.reject_compressed(&state, keys)
    }

    async fn query_series(&self, selector: &SeriesSelector) -> Result<Vec<TimeSeries>, StoreError> {
        let _conn = self.acquire().await?;
        let state = self.state.lock();
        let mut out = Vec::new();
        for entry in state.series.values() {
            if !selector
                .label_ids
                .iter()
                .all(|id| entry.label_ids.contains(id))
            {
                continue;
            }
            let samples: Vec<Sample> = entry
                .samples
                .iter()
                .filter(|s| s.timestamp >= selector.start_ms && s.timestamp <= selector.end_ms)
                .copied()
                .collect();
            if samples.is_empty() {
                continue;
            }
            let labels = Labels::new(
                entry
                    .label_ids
                    .iter()
                    .filter_map(|id| state.labels_by_id.get(id).cloned())
                    .collect(),
            );
            out.push(TimeSeries::new(labels, samples));
        }
        Ok(out)
    }

    async fn insert_spans(&self, batch: &TraceBatch) -> Result<u64, StoreError> {
        let _conn = self.acquire().await?;
        let mut state = self.state.lock();
        self.reject_compressed(&state, spans(batch).map(|s| (ChunkTable::Span, s.start_ms())))?;

        let mut written = 0;
        for span in spans(batch) {
            let key = (ChunkTable::Span, self.bucket(span.start_ms()));
            state.chunks.entry(key).or_default();
            state.spans.push(span.clone());
            written += 1;
        }
        Ok(written)
    }

    async fn database_stats(&self) -> Result<DatabaseStats, StoreError> {
        let _conn = self.acquire().await?;
        let state = self.state.lock();
        Ok(DatabaseStats {
            compression_enabled: self.compression_enabled,
            maintenance_jobs: self.maintenance_jobs,
            chunks_created: state.chunks.len() as u64,
        })
    }

    async fn series_epoch(&self) -> Result<i64, StoreError> {
        self.record("series_epoch");
        let _conn = self.acquire().await?;
        Ok(self.state.lock().series_epoch)
    }

    async fn supports_telemetry(&self) -> Result<bool, StoreError> {
        let _conn = self.acquire().await?;
        Ok(self.telemetry_supported)
    }

    async fn write_telemetry(&self, report: &TelemetryReport) -> Result<(), StoreError> {
        self.record("write_telemetry");
        let _conn = self.acquire().await?;
        if !self.telemetry_supported {
            return Err(StoreError::Unsupported("telemetry".to_string()));
        }
        self.state.lock().telemetry.push(report.clone());
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
        self.connections.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SeriesSamples;
    use std::sync::Arc;

    async fn series(store: &MemoryStore, labels: &Labels) -> SeriesId {
        let metric = store
            .get_or_create_metric(labels.metric_name().unwrap())
            .await
            .unwrap();
        let ids = store.get_or_create_labels(labels.as_slice()).await.unwrap();
        store.get_or_create_series(metric, &ids).await.unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_creates_converge() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.get_or_create_metric("up").await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_strict_copy_into_compressed_chunk_writes_nothing() {
        let store = MemoryStore::new().with_chunk_interval_ms(1000);
        let labels = Labels::from_pairs([("__name__", "up")]);
        let id = series(&store, &labels).await;
        store.compress_chunk_containing(1500);

        let batch = CopyBatch {
            samples: vec![SeriesSamples {
                series_id: id,
                samples: vec![Sample::new(500, 1.0), Sample::new(1500, 2.0)],
            }],
            exemplars: vec![],
        };
        let err = store.copy(batch.clone(), false).await.unwrap_err();
        assert!(err.is_chunk_compressed());
        assert!(store.samples(&labels).is_empty());

        let report = store.copy(batch, true).await.unwrap();
        assert_eq!(
            report,
            CopyReport {
                written: 1,
                skipped: 1,
                exemplars_skipped: 0
            }
        );
        assert_eq!(store.samples(&labels), vec![Sample::new(500, 1.0)]);
    }

    #[tokio::test]
    async fn test_lenient_copy_counts_skipped_exemplars() {
        let store = MemoryStore::new().with_chunk_interval_ms(1000);
        let labels = Labels::from_pairs([("__name__", "up")]);
        let id = series(&store, &labels).await;
        store.compress_exemplar_chunk_containing(1500);

        let exemplar = |timestamp| ExemplarRow {
            series_id: id,
            timestamp,
            value: 1.0,
            label_values: vec![Some("abc".to_string())],
        };
        let batch = CopyBatch {
            samples: vec![],
            exemplars: vec![exemplar(500), exemplar(1500)],
        };
        let report = store.copy(batch, true).await.unwrap();
        assert_eq!(report.exemplars_skipped, 1);
        assert_eq!(store.exemplars(id).len(), 1);
    }

    #[tokio::test]
    async fn test_check_writable_finds_compressed_chunks() {
        let store = MemoryStore::new().with_chunk_interval_ms(1000);
        assert!(store.check_writable(&[500, 1500], &[1500]).await.is_ok());

        store.compress_chunk_containing(1500);
        let err = store.check_writable(&[500, 1500], &[]).await.unwrap_err();
        assert!(err.is_chunk_compressed());
        // sample and exemplar chunks are tracked separately
        assert!(store.check_writable(&[500], &[1500]).await.is_ok());
    }

    #[tokio::test]
    async fn test_spans_into_compressed_chunk_write_nothing() {
        let store = MemoryStore::new().with_chunk_interval_ms(1000);
        store.compress_span_chunk_containing(1500);

        let span = |id: usize, start_ms: i64| Span {
            trace_id: format!("{:032x}", id),
            span_id: format!("{:016x}", id),
            parent_span_id: String::new(),
            name: "GET /".to_string(),
            start_time_unix_nano: start_ms * 1_000_000,
            end_time_unix_nano: (start_ms + 5) * 1_000_000,
            attributes: Default::default(),
        };
        let batch = TraceBatch {
            resource_spans: vec![crate::types::ResourceSpans {
                resource: Default::default(),
                scope: Default::default(),
                spans: vec![span(1, 500), span(2, 1500)],
            }],
        };
        let err = store.insert_spans(&batch).await.unwrap_err();
        assert!(err.is_chunk_compressed());
        assert_eq!(store.span_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_pool_exhausted() {
        let store = MemoryStore::new()
            .with_max_connections(1)
            .with_acquire_timeout(Duration::from_millis(20));
        let _held = store.acquire().await.unwrap();
        assert!(matches!(store.ping().await, Err(StoreError::PoolTimeout)));
    }

    #[tokio::test]
    async fn test_unreachable_and_closed() {
        let store = MemoryStore::new();
        store.set_unreachable(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unreachable(_))));
        store.set_unreachable(false);
        assert!(store.ping().await.is_ok());

        store.close().await;
        assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_exemplar_positions_are_stable() {
        let store = MemoryStore::new();
        let first = store
            .get_or_create_exemplar_positions("up", &["trace_id".to_string()])
            .await
            .unwrap();
        let second = store
            .get_or_create_exemplar_positions(
                "up",
                &["span_id".to_string(), "trace_id".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(first["trace_id"], 0);
        assert_eq!(second["trace_id"], 0);
        assert_eq!(second["span_id"], 1);
    }
}
