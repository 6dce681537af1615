//! Copy workers
//!
//! Each worker owns one partition of every batch. For its share it resolves
//! metric, label, series and exemplar position ids through the caches
//! (touching the store only on misses), lays the rows out column-wise and
//! issues a single bulk copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::metrics::IngestionMetrics;
use crate::cache::CacheSet;
use crate::error::Error;
use crate::metrics::{COPY_ERRORS_TOTAL, SAMPLES_INGESTED_TOTAL, SAMPLES_SKIPPED_COMPRESSED_TOTAL};
use crate::resolver::LabelResolver;
use crate::store::{CopyBatch, CopyReport, ExemplarRow, SeriesSamples, Store};
use crate::types::{Exemplar, Labels, SeriesId, TimeSeries};

/// Work handed to a copier
pub(crate) struct CopyRequest {
    /// Series routed to this copier
    pub series: Vec<TimeSeries>,
    /// Where to send the outcome; `None` in asynchronous-ack mode
    pub reply: Option<oneshot::Sender<Result<CopyReport, Error>>>,
}

/// A single copy worker
pub(crate) struct CopyWorker {
    /// Worker ID
    id: usize,
    store: Arc<dyn Store>,
    caches: CacheSet,
    resolver: LabelResolver,
    ignore_compressed: bool,
    metrics: Arc<IngestionMetrics>,
}

impl CopyWorker {
    pub fn new(
        id: usize,
        store: Arc<dyn Store>,
        caches: CacheSet,
        resolver: LabelResolver,
        ignore_compressed: bool,
        metrics: Arc<IngestionMetrics>,
    ) -> Self {
        Self {
            id,
            store,
            caches,
            resolver,
            ignore_compressed,
            metrics,
        }
    }

    /// Serve requests until every sender is dropped
    ///
    /// Requests already queued when the channel closes are still processed.
    pub async fn run(self, mut rx: mpsc::Receiver<CopyRequest>) {
        debug!(worker = self.id, "copy worker started");
        while let Some(request) = rx.recv().await {
            let result = self.process(request.series).await;
            match request.reply {
                Some(reply) => {
                    // caller may have gone away; the outcome is already counted
                    let _ = reply.send(result);
                },
                None => {
                    if let Err(e) = result {
                        warn!(worker = self.id, error = %e, "asynchronous copy failed");
                    }
                },
            }
        }
        debug!(worker = self.id, "copy worker drained");
    }

    /// Resolve ids and copy one partition
    async fn process(&self, series: Vec<TimeSeries>) -> Result<CopyReport, Error> {
        let start = Instant::now();
        let result = self.copy_series(series).await;
        match &result {
            Ok(report) => {
                self.metrics
                    .record_copy(report.written, report.skipped, start.elapsed());
                SAMPLES_INGESTED_TOTAL.inc_by(report.written);
                SAMPLES_SKIPPED_COMPRESSED_TOTAL.inc_by(report.skipped);
            },
            Err(_) => {
                self.metrics.record_copy_error();
                COPY_ERRORS_TOTAL.inc();
            },
        }
        result
    }

    async fn copy_series(&self, series: Vec<TimeSeries>) -> Result<CopyReport, Error> {
        let mut batch = CopyBatch::default();
        for ts in series {
            let series_id = self.series_id(&ts.labels).await?;
            if !ts.exemplars.is_empty() {
                let rows = self.exemplar_rows(series_id, &ts.labels, &ts.exemplars).await?;
                batch.exemplars.extend(rows);
            }
            if !ts.samples.is_empty() {
                batch.samples.push(SeriesSamples {
                    series_id,
                    samples: ts.samples,
                });
            }
        }

        if batch.is_empty() {
            return Ok(CopyReport::default());
        }

        self.store
            .copy(batch, self.ignore_compressed)
            .await
            .map_err(super::copy_error)
    }

    /// Series id for a canonical label set, resolved through the caches
    async fn series_id(&self, labels: &Labels) -> Result<SeriesId, Error> {
        if let Some(id) = self.caches.series.get(labels) {
            return Ok(id);
        }

        let name = labels
            .metric_name()
            .ok_or_else(|| crate::error::IngestionError::InvalidSeries(labels.to_string()))?;
        let metric_id = self
            .caches
            .metrics
            .resolve(name.to_string(), || self.store.get_or_create_metric(name))
            .await?;
        let label_ids = self.resolver.resolve(labels.as_slice()).await?;
        let series_id = self.store.get_or_create_series(metric_id, &label_ids).await?;

        self.caches.series.insert(labels.clone(), series_id);
        Ok(series_id)
    }

    /// Lay exemplar labels out by the metric's key positions
    async fn exemplar_rows(
        &self,
        series_id: SeriesId,
        labels: &Labels,
        exemplars: &[Exemplar],
    ) -> Result<Vec<ExemplarRow>, Error> {
        let metric = labels.metric_name().unwrap_or_default();
        let mut keys: Vec<String> = exemplars
            .iter()
            .flat_map(|e| e.labels.iter().map(|l| l.name.clone()))
            .collect();
        keys.sort();
        keys.dedup();

        let positions = match self.caches.exemplar_positions.get(metric) {
            Some(known) if keys.iter().all(|k| known.contains_key(k)) => known,
            _ => {
                let fresh: Arc<HashMap<String, usize>> = Arc::new(
                    self.store
                        .get_or_create_exemplar_positions(metric, &keys)
                        .await?,
                );
                self.caches
                    .exemplar_positions
                    .insert(metric.to_string(), Arc::clone(&fresh));
                fresh
            },
        };

        let width = positions.values().max().map(|m| m + 1).unwrap_or(0);
        Ok(exemplars
            .iter()
            .map(|e| {
                let mut label_values = vec![None; width];
                for label in &e.labels {
                    if let Some(pos) = positions.get(&label.name) {
                        label_values[*pos] = Some(label.value.clone());
                    }
                }
                ExemplarRow {
                    series_id,
                    timestamp: e.timestamp,
                    value: e.value,
                    label_values,
                }
            })
            .collect())
    }
}
