//! Identifier caches
//!
//! Four independent bounded caches sit in front of the store so that a write
//! only reaches the database for identifiers it has not seen recently:
//!
//! | Cache                  | Key                     | Value                        |
//! |------------------------|-------------------------|------------------------------|
//! | `metrics`              | metric name             | metric id                    |
//! | `labels`               | label pair              | label id                     |
//! | `series`               | canonical label set     | series id                    |
//! | `exemplar_positions`   | metric name             | exemplar key -> position map |
//!
//! The series cache is the only one whose entries can go stale (series ids
//! are recycled when series are dropped); [`CacheMaintenance`] clears it when
//! the store's series epoch moves.

pub mod identifier;
pub mod maintenance;

pub use identifier::{CacheStats, IdentifierCache};
pub use maintenance::CacheMaintenance;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntGaugeVec, Opts};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::types::{Label, LabelId, Labels, MetricId, SeriesId};

/// Metric name -> metric id
pub type MetricCache = IdentifierCache<String, MetricId>;

/// Label pair -> label id
pub type LabelCache = IdentifierCache<Label, LabelId>;

/// Canonical label set -> series id
pub type SeriesCache = IdentifierCache<Labels, SeriesId>;

/// Metric name -> exemplar label key positions
pub type ExemplarPositionCache = IdentifierCache<String, Arc<HashMap<String, usize>>>;

/// The four caches shared by ingestion and query paths
#[derive(Clone)]
pub struct CacheSet {
    /// Metric name cache
    pub metrics: Arc<MetricCache>,
    /// Label cache
    pub labels: Arc<LabelCache>,
    /// Series cache
    pub series: Arc<SeriesCache>,
    /// Exemplar label position cache
    pub exemplar_positions: Arc<ExemplarPositionCache>,
}

impl CacheSet {
    /// Create all caches sized from config
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            metrics: Arc::new(IdentifierCache::new("metric", config.metrics_capacity)),
            labels: Arc::new(IdentifierCache::new("label", config.labels_capacity)),
            series: Arc::new(IdentifierCache::new("series", config.series_capacity)),
            exemplar_positions: Arc::new(IdentifierCache::new(
                "exemplar_position",
                config.exemplar_capacity,
            )),
        }
    }

    /// `(name, len, cap)` for every cache
    pub fn sizes(&self) -> [(&'static str, usize, usize); 4] {
        [
            (self.metrics.name(), self.metrics.len(), self.metrics.cap()),
            (self.labels.name(), self.labels.len(), self.labels.cap()),
            (self.series.name(), self.series.len(), self.series.cap()),
            (
                self.exemplar_positions.name(),
                self.exemplar_positions.len(),
                self.exemplar_positions.cap(),
            ),
        ]
    }

    /// Drop every entry in every cache
    pub fn clear_all(&self) {
        self.metrics.clear();
        self.labels.clear();
        self.series.clear();
        self.exemplar_positions.clear();
    }
}

/// Exposes cache sizes as gauges, read at scrape time
pub struct CacheCollector {
    caches: CacheSet,
    elements: IntGaugeVec,
    capacity: IntGaugeVec,
}

impl CacheCollector {
    /// Build a collector over the given caches
    pub fn new(caches: CacheSet) -> prometheus::Result<Self> {
        let elements = IntGaugeVec::new(
            Opts::new("promstore_cache_elements", "Entries currently held per identifier cache"),
            &["cache"],
        )?;
        let capacity = IntGaugeVec::new(
            Opts::new("promstore_cache_capacity", "Maximum entries per identifier cache"),
            &["cache"],
        )?;
        Ok(Self {
            caches,
            elements,
            capacity,
        })
    }
}

impl Collector for CacheCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.elements
            .desc()
            .into_iter()
            .chain(self.capacity.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        for (name, len, cap) in self.caches.sizes() {
            self.elements.with_label_values(&[name]).set(len as i64);
            self.capacity.with_label_values(&[name]).set(cap as i64);
        }
        let mut families = self.elements.collect();
        families.extend(self.capacity.collect());
        families
    }
}
