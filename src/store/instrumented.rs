//! Role-tagged store handles
//!
//! The client shares one pool between read and write traffic. Each side gets
//! its own [`InstrumentedStore`] over the same backend so requests can be
//! told apart in logs and in `promstore_store_requests_total{role,op}`
//! without a second pool.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::{CopyBatch, CopyReport, DatabaseStats, SeriesSelector, Store};
use crate::error::StoreError;
use crate::metrics::{STORE_ERRORS_TOTAL, STORE_REQUEST_DURATION, STORE_REQUESTS_TOTAL};
use crate::telemetry::TelemetryReport;
use crate::types::{Label, LabelId, MetricId, SeriesId, TimeSeries, TraceBatch};

/// Which traffic a handle carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    /// Ingestion, health and telemetry
    Write,
    /// Remote read and label lookups for queries
    Read,
}

impl StoreRole {
    /// Metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreRole::Write => "write",
            StoreRole::Read => "read",
        }
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store handle that logs and counts every call under its role
///
/// The handle never closes the backend; only the client that owns the pool
/// does.
#[derive(Clone)]
pub struct InstrumentedStore {
    inner: Arc<dyn Store>,
    role: StoreRole,
}

impl InstrumentedStore {
    /// Wrap a shared backend
    pub fn new(inner: Arc<dyn Store>, role: StoreRole) -> Self {
        Self { inner, role }
    }

    /// Role of this handle
    pub fn role(&self) -> StoreRole {
        self.role
    }

    /// Run one store call under instrumentation
    async fn observe<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let role = self.role.as_str();
        STORE_REQUESTS_TOTAL.with_label_values(&[role, op]).inc();
        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed();
        STORE_REQUEST_DURATION
            .with_label_values(&[role, op])
            .observe(elapsed.as_secs_f64());
        match &result {
            Ok(_) => debug!(role, op, elapsed_us = elapsed.as_micros() as u64, "store call"),
            Err(e) => {
                STORE_ERRORS_TOTAL.with_label_values(&[role, op]).inc();
                debug!(role, op, error = %e, "store call failed");
            },
        }
        result
    }
}

#[async_trait]
impl Store for InstrumentedStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.observe("ping", self.inner.ping()).await
    }

    async fn get_or_create_metric(&self, name: &str) -> Result<MetricId, StoreError> {
        self.observe("get_or_create_metric", self.inner.get_or_create_metric(name))
            .await
    }

    async fn get_or_create_labels(&self, labels: &[Label]) -> Result<Vec<LabelId>, StoreError> {
        self.observe("get_or_create_labels", self.inner.get_or_create_labels(labels))
            .await
    }

    async fn lookup_labels(&self, labels: &[Label]) -> Result<Vec<Option<LabelId>>, StoreError> {
        self.observe("lookup_labels", self.inner.lookup_labels(labels))
            .await
    }

    async fn get_or_create_series(
        &self,
        metric: MetricId,
        label_ids: &[LabelId],
    ) -> Result<SeriesId, StoreError> {
        self.observe(
            "get_or_create_series",
            self.inner.get_or_create_series(metric, label_ids),
        )
        .await
    }

    async fn get_or_create_exemplar_positions(
        &self,
        metric: &str,
        keys: &[String],
    ) -> Result<HashMap<String, usize>, StoreError> {
        self.observe(
            "get_or_create_exemplar_positions",
            self.inner.get_or_create_exemplar_positions(metric, keys),
        )
        .await
    }

    async fn copy(
        &self,
        batch: CopyBatch,
        ignore_compressed: bool,
    ) -> Result<CopyReport, StoreError> {
        self.observe("copy", self.inner.copy(batch, ignore_compressed))
            .await
    }

    async fn check_writable(
        &self,
        sample_times: &[i64],
        exemplar_times: &[i64],
    ) -> Result<(), StoreError> {
        self.observe(
            "check_writable",
            self.inner.check_writable(sample_times, exemplar_times),
        )
        .await
    }

    async fn query_series(&self, selector: &SeriesSelector) -> Result<Vec<TimeSeries>, StoreError> {
        self.observe("query_series", self.inner.query_series(selector))
            .await
    }

    async fn insert_spans(&self, batch: &TraceBatch) -> Result<u64, StoreError> {
        self.observe("insert_spans", self.inner.insert_spans(batch))
            .await
    }

    async fn database_stats(&self) -> Result<DatabaseStats, StoreError> {
        self.observe("database_stats", self.inner.database_stats())
            .await
    }

    async fn series_epoch(&self) -> Result<i64, StoreError> {
        self.observe("series_epoch", self.inner.series_epoch())
            .await
    }

    async fn supports_telemetry(&self) -> Result<bool, StoreError> {
        self.observe("supports_telemetry", self.inner.supports_telemetry())
            .await
    }

    async fn write_telemetry(&self, report: &TelemetryReport) -> Result<(), StoreError> {
        self.observe("write_telemetry", self.inner.write_telemetry(report))
            .await
    }

    async fn close(&self) {
        debug!(role = %self.role, "store handle released; pool left to its owner");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_roles_are_counted_separately() {
        let backend: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let read = InstrumentedStore::new(Arc::clone(&backend), StoreRole::Read);
        let write = InstrumentedStore::new(Arc::clone(&backend), StoreRole::Write);

        let read_before = STORE_REQUESTS_TOTAL.with_label_values(&["read", "ping"]).get();
        let write_before = STORE_REQUESTS_TOTAL.with_label_values(&["write", "ping"]).get();

        read.ping().await.unwrap();
        read.ping().await.unwrap();
        write.ping().await.unwrap();

        assert!(STORE_REQUESTS_TOTAL.with_label_values(&["read", "ping"]).get() >= read_before + 2);
        assert!(STORE_REQUESTS_TOTAL.with_label_values(&["write", "ping"]).get() >= write_before + 1);
    }

    #[tokio::test]
    async fn test_handle_close_leaves_backend_open() {
        let memory = Arc::new(MemoryStore::new());
        let backend: Arc<dyn Store> = memory.clone();
        let handle = InstrumentedStore::new(backend, StoreRole::Write);
        handle.close().await;
        assert!(!memory.is_closed());
        assert!(handle.ping().await.is_ok());
    }
}
