//! Ingestion coordinator
//!
//! Accepts decoded write batches and fans them out to a fixed set of copy
//! workers.
//!
//! # Architecture
//!
//! ```text
//! [WriteRequest] → [HashPartitioner] → [copier 0] → resolve ids → copy ┐
//!                                    → [copier 1] → resolve ids → copy ├→ [Store]
//!                                    → [copier N] → resolve ids → copy ┘
//! ```
//!
//! # Acknowledgement
//!
//! - **Synchronous** (default): `ingest` waits until every partition has
//!   committed and reports how many samples were written.
//! - **Asynchronous**: `ingest` returns once every partition is queued on its
//!   worker; failures are logged and counted but not reported to the caller.
//!
//! # Failure policy
//!
//! A failing worker never cancels its siblings. Their outcomes are collected
//! and, if any failed, returned as [`IngestionError::Partial`] carrying the
//! number of samples that did commit.
//!
//! Unless compressed chunks are ignored, the batch's timestamps are checked
//! against compressed chunks before anything is queued, so a batch that
//! targets one fails as a whole with nothing written.
//!
//! # Shutdown
//!
//! [`IngestionCoordinator::close`] rejects new batches, waits for admitted
//! batches to finish, then drains and joins the workers. Calling it again is
//! a no-op.

pub mod metrics;
pub mod partition;
mod worker;

pub use metrics::{IngestionCollector, IngestionMetrics, IngestionStats};
pub use partition::HashPartitioner;

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheSet;
use crate::config::IngestConfig;
use crate::error::{Error, IngestionError, Result, StoreError};
use crate::metrics::{INGEST_DURATION, SPANS_INGESTED_TOTAL};
use crate::resolver::LabelResolver;
use crate::store::{CopyReport, Store};
use crate::types::{TimeSeries, TraceBatch, WriteRequest};
use worker::{CopyRequest, CopyWorker};

/// Surface a compressed chunk as its own error kind
pub(crate) fn copy_error(e: StoreError) -> Error {
    match e {
        StoreError::ChunkCompressed { table, chunk } => {
            Error::ChunkCompressed(format!("copy into compressed chunk {} of {}", chunk, table))
        },
        other => Error::Store(other),
    }
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Number of copy workers (at least one)
    pub num_copiers: usize,
    /// Skip rows landing in compressed chunks instead of failing the batch
    pub ignore_compressed_chunks: bool,
    /// Acknowledge batches once queued on the workers
    pub async_acks: bool,
    /// Requests buffered per worker
    pub channel_capacity: usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            num_copiers: 1,
            ignore_compressed_chunks: false,
            async_acks: false,
            channel_capacity: 64,
        }
    }
}

impl IngestorConfig {
    /// Build from the `[ingest]` section and a resolved copier count
    pub fn from_config(config: &IngestConfig, num_copiers: usize) -> Self {
        Self {
            num_copiers,
            ignore_compressed_chunks: config.ignore_compressed_chunks,
            async_acks: config.async_acks,
            channel_capacity: config.channel_capacity,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.num_copiers == 0 {
            return Err("num_copiers must be > 0".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be > 0".to_string());
        }
        Ok(())
    }
}

/// Outcome of an accepted write batch
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Samples committed, or queued when `committed` is false
    pub samples_written: u64,
    /// Samples skipped (compressed chunks, series without a metric name)
    pub samples_rejected: u64,
    /// Exemplars skipped in compressed chunks
    pub exemplars_rejected: u64,
    /// False in asynchronous-ack mode, where nothing has been confirmed yet
    pub committed: bool,
    /// Non-fatal problems, e.g. skipped compressed chunks
    pub warnings: Vec<Error>,
}

/// Fans write batches out to copy workers
pub struct IngestionCoordinator {
    config: IngestorConfig,
    partitioner: HashPartitioner,
    /// Worker queues; `None` once shutdown has started
    senders: RwLock<Option<Vec<mpsc::Sender<CopyRequest>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Store>,
    closed: AtomicBool,
    metrics: Arc<IngestionMetrics>,
}

impl IngestionCoordinator {
    /// Validate the config and start the copy workers
    pub fn new(
        config: IngestorConfig,
        store: Arc<dyn Store>,
        caches: CacheSet,
        resolver: LabelResolver,
    ) -> Result<Self> {
        config.validate().map_err(Error::Configuration)?;

        let metrics = Arc::new(IngestionMetrics::new());
        let mut senders = Vec::with_capacity(config.num_copiers);
        let mut handles = Vec::with_capacity(config.num_copiers);
        for id in 0..config.num_copiers {
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            let worker = CopyWorker::new(
                id,
                Arc::clone(&store),
                caches.clone(),
                resolver.clone(),
                config.ignore_compressed_chunks,
                Arc::clone(&metrics),
            );
            handles.push(tokio::spawn(worker.run(rx)));
            senders.push(tx);
        }

        info!(
            num_copiers = config.num_copiers,
            async_acks = config.async_acks,
            ignore_compressed_chunks = config.ignore_compressed_chunks,
            "ingestion coordinator started"
        );

        Ok(Self {
            partitioner: HashPartitioner::new(config.num_copiers),
            config,
            senders: RwLock::new(Some(senders)),
            handles: Mutex::new(handles),
            store,
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Write a batch of series
    ///
    /// Returns [`Error::Closed`] once `close` has started. Series without a
    /// metric name are rejected individually; the rest of the batch proceeds.
    pub async fn ingest(&self, request: WriteRequest) -> Result<IngestReport> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let start = Instant::now();

        // Held until every reply arrives so `close` waits for admitted batches
        let guard = self.senders.read().await;
        let Some(senders) = guard.as_ref() else {
            return Err(Error::Closed);
        };

        let total = request.num_samples() as u64;
        self.metrics.record_batch(total);

        let mut errors: Vec<Error> = Vec::new();
        let mut rejected = 0u64;
        let (valid, invalid): (Vec<_>, Vec<_>) = request
            .timeseries
            .into_iter()
            .filter(|ts| !ts.samples.is_empty() || !ts.exemplars.is_empty())
            .partition(|ts| ts.labels.metric_name().is_some());
        for ts in invalid {
            rejected += ts.samples.len() as u64;
            errors.push(IngestionError::InvalidSeries(ts.labels.to_string()).into());
        }
        self.metrics.record_rejected(rejected);

        // Copies commit per partition, so a strict batch is vetted up front
        if !self.config.ignore_compressed_chunks {
            if let Err(e) = self.check_writable(&valid).await {
                let samples: u64 = valid.iter().map(|ts| ts.samples.len() as u64).sum();
                self.metrics.record_rejected(samples);
                warn!(error = %e, "batch rejected before copy");
                return Err(e);
            }
        }

        let mut pending = Vec::new();
        let mut queued = 0u64;
        for (copier, series) in self.partitioner.split(valid).into_iter().enumerate() {
            if series.is_empty() {
                continue;
            }
            let samples: u64 = series.iter().map(|ts| ts.samples.len() as u64).sum();
            let (reply, rx) = if self.config.async_acks {
                (None, None)
            } else {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            };
            match senders[copier].send(CopyRequest { series, reply }).await {
                Ok(()) => {
                    queued += samples;
                    if let Some(rx) = rx {
                        pending.push((copier, rx));
                    }
                },
                Err(_) => errors.push(IngestionError::WorkerGone(copier).into()),
            }
        }

        let mut report = IngestReport {
            samples_rejected: rejected,
            committed: !self.config.async_acks,
            ..IngestReport::default()
        };

        if self.config.async_acks {
            drop(guard);
            report.samples_written = queued;
        } else {
            let outcomes = join_all(pending.into_iter().map(|(copier, rx)| async move {
                rx.await
                    .unwrap_or_else(|_| Err(IngestionError::WorkerGone(copier).into()))
            }))
            .await;
            drop(guard);
            for outcome in outcomes {
                match outcome {
                    Ok(CopyReport {
                        written,
                        skipped,
                        exemplars_skipped,
                    }) => {
                        report.samples_written += written;
                        report.samples_rejected += skipped;
                        report.exemplars_rejected += exemplars_skipped;
                        if skipped > 0 || exemplars_skipped > 0 {
                            report.warnings.push(Error::ChunkCompressed(format!(
                                "{} samples and {} exemplars skipped in compressed chunks",
                                skipped, exemplars_skipped
                            )));
                        }
                    },
                    Err(e) => errors.push(e),
                }
            }
        }

        INGEST_DURATION.observe(start.elapsed().as_secs_f64());

        if errors.is_empty() {
            debug!(
                written = report.samples_written,
                rejected = report.samples_rejected,
                "batch ingested"
            );
            return Ok(report);
        }

        // a single failure with nothing written is surfaced as-is
        if errors.len() == 1 && report.samples_written == 0 {
            if let Some(e) = errors.pop() {
                return Err(e);
            }
        }
        Err(IngestionError::Partial {
            written: report.samples_written,
            errors,
        }
        .into())
    }

    /// Fail with [`Error::ChunkCompressed`] if any row of the batch targets a
    /// compressed chunk
    async fn check_writable(&self, series: &[TimeSeries]) -> Result<()> {
        let samples: Vec<i64> = series
            .iter()
            .flat_map(|ts| ts.samples.iter().map(|s| s.timestamp))
            .collect();
        let exemplars: Vec<i64> = series
            .iter()
            .flat_map(|ts| ts.exemplars.iter().map(|e| e.timestamp))
            .collect();
        self.store
            .check_writable(&samples, &exemplars)
            .await
            .map_err(copy_error)
    }

    /// Write spans straight to the store
    pub async fn ingest_traces(&self, batch: TraceBatch) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let written = self.store.insert_spans(&batch).await?;
        self.metrics.record_spans(written);
        SPANS_INGESTED_TOTAL.inc_by(written);
        debug!(spans = written, "traces ingested");
        Ok(())
    }

    /// Reject new batches, drain admitted ones and stop the workers
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing ingestion coordinator");

        // Waits for in-flight `ingest` calls, then drops every queue sender
        let senders = self.senders.write().await.take();
        drop(senders);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "copy worker panicked");
            }
        }
        info!("ingestion coordinator closed");
    }

    /// True once `close` has started
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of copy workers
    pub fn num_copiers(&self) -> usize {
        self.config.num_copiers
    }

    /// Ingestion counters
    pub fn stats(&self) -> IngestionStats {
        self.metrics.snapshot()
    }

    /// Shared handle to the live counters
    pub fn metrics(&self) -> Arc<IngestionMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::MemoryStore;
    use crate::types::{Labels, Sample, TimeSeries};

    fn coordinator(store: Arc<MemoryStore>, config: IngestorConfig) -> IngestionCoordinator {
        let caches = CacheSet::new(&CacheConfig::default());
        let resolver = LabelResolver::new(store.clone(), caches.labels.clone());
        IngestionCoordinator::new(config, store, caches, resolver).unwrap()
    }

    fn request(n_series: usize, samples: usize) -> WriteRequest {
        WriteRequest::new(
            (0..n_series)
                .map(|i| {
                    TimeSeries::new(
                        Labels::from_pairs([("__name__", "up"), ("instance", &*format!("host-{i}"))]),
                        (0..samples).map(|t| Sample::new(t as i64, 1.0)).collect(),
                    )
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_sync_ingest_reports_commits() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(
            store.clone(),
            IngestorConfig {
                num_copiers: 4,
                ..IngestorConfig::default()
            },
        );
        let report = c.ingest(request(10, 3)).await.unwrap();
        assert_eq!(report.samples_written, 30);
        assert!(report.committed);
        assert_eq!(store.series_count(), 10);
        // one copy per non-empty partition
        assert!(store.calls().copies <= 4);
        c.close().await;
    }

    #[tokio::test]
    async fn test_invalid_series_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone(), IngestorConfig::default());
        let mut req = request(2, 1);
        req.timeseries.push(TimeSeries::new(
            Labels::from_pairs([("job", "nameless")]),
            vec![Sample::new(1, 1.0)],
        ));
        let err = c.ingest(req).await.unwrap_err();
        assert_eq!(err.samples_written(), 2);
        match err {
            Error::Ingestion(IngestionError::Partial { errors, .. }) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected {other}"),
        }
        c.close().await;
    }

    #[tokio::test]
    async fn test_strict_batch_is_vetted_before_any_copy() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(
            store.clone(),
            IngestorConfig {
                num_copiers: 4,
                ..IngestorConfig::default()
            },
        );
        store.compress_chunk_containing(0);

        let err = c.ingest(request(12, 2)).await.unwrap_err();
        assert!(err.is_chunk_compressed());
        assert_eq!(err.samples_written(), 0);
        assert_eq!(store.calls().copies, 0);
        assert_eq!(c.stats().samples_rejected, 24);
        c.close().await;
    }

    #[tokio::test]
    async fn test_closed_rejects_and_close_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store, IngestorConfig::default());
        c.close().await;
        c.close().await;
        assert!(c.is_closed());
        assert!(matches!(c.ingest(request(1, 1)).await, Err(Error::Closed)));
        assert!(matches!(
            c.ingest_traces(TraceBatch::default()).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_drains_async_batches() {
        let store = Arc::new(MemoryStore::new().with_copy_latency(std::time::Duration::from_millis(20)));
        let c = coordinator(
            store.clone(),
            IngestorConfig {
                num_copiers: 2,
                async_acks: true,
                ..IngestorConfig::default()
            },
        );
        let report = c.ingest(request(6, 2)).await.unwrap();
        assert!(!report.committed);
        assert_eq!(report.samples_written, 12);

        c.close().await;
        assert_eq!(c.stats().samples_written, 12);
    }

    #[test]
    fn test_config_validation() {
        let bad = IngestorConfig {
            num_copiers: 0,
            ..IngestorConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(IngestorConfig::default().validate().is_ok());
    }
}
