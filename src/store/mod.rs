//! Store abstraction
//!
//! The [`Store`] trait is the seam between the coordination layer (caches,
//! resolver, ingestion workers, health and telemetry loops) and the
//! relational backend. Every `get_or_create_*` operation must be idempotent
//! under concurrent invocation: two callers racing on the same key converge
//! on the same identifier. Implementations enforce this with a uniqueness
//! constraint plus insert-on-conflict-do-nothing followed by a reselect.
//!
//! # Implementations
//!
//! - [`PgStore`]: PostgreSQL/TimescaleDB through a `sqlx` connection pool
//! - [`MemoryStore`]: in-process store for tests and development
//! - [`InstrumentedStore`]: wraps either with a read or write role for logging and metrics

pub mod instrumented;
pub mod memory;
pub mod postgres;
pub mod util;

pub use instrumented::{InstrumentedStore, StoreRole};
pub use memory::MemoryStore;
pub use postgres::{ConnectHook, PgStore};
pub use util::redact_connection_string;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::StoreError;
use crate::telemetry::TelemetryReport;
use crate::types::{Label, LabelId, MetricId, Sample, SeriesId, TimeSeries, TraceBatch};

/// Samples for one resolved series
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSamples {
    /// Series the samples belong to
    pub series_id: SeriesId,
    /// Samples in arrival order
    pub samples: Vec<Sample>,
}

/// One exemplar row with its label values laid out by position
#[derive(Debug, Clone, PartialEq)]
pub struct ExemplarRow {
    /// Series the exemplar belongs to
    pub series_id: SeriesId,
    /// Unix milliseconds
    pub timestamp: i64,
    /// Exemplar value
    pub value: f64,
    /// Label values indexed by the metric's exemplar key positions
    pub label_values: Vec<Option<String>>,
}

/// Column-oriented rows issued as a single bulk copy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopyBatch {
    /// Sample rows grouped by series
    pub samples: Vec<SeriesSamples>,
    /// Exemplar rows
    pub exemplars: Vec<ExemplarRow>,
}

impl CopyBatch {
    /// Total sample rows
    pub fn num_samples(&self) -> usize {
        self.samples.iter().map(|s| s.samples.len()).sum()
    }

    /// True when there is nothing to copy
    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0 && self.exemplars.is_empty()
    }
}

/// Outcome of a bulk copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Sample rows committed
    pub written: u64,
    /// Sample rows skipped because their chunk is compressed
    pub skipped: u64,
    /// Exemplar rows skipped because their chunk is compressed
    pub exemplars_skipped: u64,
}

/// Candidate series selection for a read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesSelector {
    /// Series must carry every one of these label ids; empty selects all series
    pub label_ids: Vec<LabelId>,
    /// Inclusive start, milliseconds
    pub start_ms: i64,
    /// Inclusive end, milliseconds
    pub end_ms: i64,
}

/// Operational statistics read from the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Native compression is available
    pub compression_enabled: bool,
    /// Background maintenance jobs registered
    pub maintenance_jobs: u64,
    /// Chunks created for ingested data
    pub chunks_created: u64,
}

/// Backend operations used by the coordination layer
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Trivial round trip
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert the metric name if absent and return its id
    async fn get_or_create_metric(&self, name: &str) -> Result<MetricId, StoreError>;

    /// Insert missing label pairs and return ids in input order
    async fn get_or_create_labels(&self, labels: &[Label]) -> Result<Vec<LabelId>, StoreError>;

    /// Look up label pairs without creating them; unknown pairs map to `None`
    async fn lookup_labels(&self, labels: &[Label]) -> Result<Vec<Option<LabelId>>, StoreError>;

    /// Insert the series if absent and return its id
    ///
    /// `label_ids` are in canonical label order.
    async fn get_or_create_series(
        &self,
        metric: MetricId,
        label_ids: &[LabelId],
    ) -> Result<SeriesId, StoreError>;

    /// Assign positions to exemplar label keys of a metric
    ///
    /// Returns the full key -> position map for the metric, which includes
    /// `keys` and any keys registered earlier.
    async fn get_or_create_exemplar_positions(
        &self,
        metric: &str,
        keys: &[String],
    ) -> Result<HashMap<String, usize>, StoreError>;

    /// Write a batch in one round trip
    ///
    /// With `ignore_compressed` rows landing in compressed chunks are skipped
    /// and counted; without it such a row fails the whole copy and nothing is
    /// written.
    async fn copy(&self, batch: CopyBatch, ignore_compressed: bool)
        -> Result<CopyReport, StoreError>;

    /// Fail with [`StoreError::ChunkCompressed`] if any timestamp would land in
    /// a compressed chunk
    ///
    /// Lets a strict multi-partition batch be rejected before any partition
    /// commits. A chunk compressed after this check is still caught by `copy`.
    async fn check_writable(
        &self,
        sample_times: &[i64],
        exemplar_times: &[i64],
    ) -> Result<(), StoreError>;

    /// Series matching the selector, with samples inside its time range
    async fn query_series(&self, selector: &SeriesSelector) -> Result<Vec<TimeSeries>, StoreError>;

    /// Persist spans; returns the number of spans written
    async fn insert_spans(&self, batch: &TraceBatch) -> Result<u64, StoreError>;

    /// Operational statistics
    async fn database_stats(&self) -> Result<DatabaseStats, StoreError>;

    /// Counter bumped whenever series ids may have been deleted or recycled
    async fn series_epoch(&self) -> Result<i64, StoreError>;

    /// Whether telemetry reports can be stored
    async fn supports_telemetry(&self) -> Result<bool, StoreError>;

    /// Store a telemetry report
    async fn write_telemetry(&self, report: &TelemetryReport) -> Result<(), StoreError>;

    /// Release backend resources
    async fn close(&self);
}
