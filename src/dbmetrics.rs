//! Database operational metrics
//!
//! Gauges mirroring [`crate::store::DatabaseStats`]. They read 0 until the
//! first [`DatabaseMetrics::update`].

use prometheus::{IntGauge, Registry};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Store;

pub const COMPRESSION_STATUS: &str = "compression_status";
pub const WORKER_MAINTENANCE_JOB: &str = "worker_maintenance_job";
pub const CHUNKS_CREATED: &str = "chunks_created";

/// Gauges fed from the store's operational statistics
pub struct DatabaseMetrics {
    store: Arc<dyn Store>,
    compression_status: IntGauge,
    worker_maintenance_job: IntGauge,
    chunks_created: IntGauge,
}

impl DatabaseMetrics {
    pub fn new(store: Arc<dyn Store>) -> prometheus::Result<Self> {
        Ok(Self {
            store,
            compression_status: IntGauge::new(
                "promstore_sql_database_compression_status",
                "Compression status in the database: 1 available, 0 not",
            )?,
            worker_maintenance_job: IntGauge::new(
                "promstore_sql_database_worker_maintenance_job",
                "Number of maintenance background jobs",
            )?,
            chunks_created: IntGauge::new(
                "promstore_sql_database_chunks_created",
                "Number of chunks created by ingestion",
            )?,
        })
    }

    /// Register every gauge
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.compression_status.clone()))?;
        registry.register(Box::new(self.worker_maintenance_job.clone()))?;
        registry.register(Box::new(self.chunks_created.clone()))?;
        Ok(())
    }

    /// Refresh all gauges from the store
    pub async fn update(&self) -> Result<()> {
        let stats = self.store.database_stats().await?;
        self.compression_status
            .set(if stats.compression_enabled { 1 } else { 0 });
        self.worker_maintenance_job.set(stats.maintenance_jobs as i64);
        self.chunks_created.set(stats.chunks_created as i64);
        debug!(?stats, "database metrics updated");
        Ok(())
    }

    /// Current value by short name, e.g. `chunks_created`
    pub fn get_metric(&self, name: &str) -> Result<f64> {
        let gauge = match name {
            COMPRESSION_STATUS => &self.compression_status,
            WORKER_MAINTENANCE_JOB => &self.worker_maintenance_job,
            CHUNKS_CREATED => &self.chunks_created,
            other => {
                return Err(Error::Configuration(format!(
                    "unknown database metric {}",
                    other
                )))
            },
        };
        Ok(gauge.get() as f64)
    }
}
