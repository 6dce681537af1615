//! Client facade
//!
//! [`Client`] composes the store, the identifier caches, the ingestion
//! coordinator, the query engine, the health monitor and telemetry, and is
//! the only type callers need.
//!
//! # Lifecycle
//!
//! ```text
//! build:  store → caches → resolver → ingestion (unless read-only) → ping → health → telemetry
//! close:  health → telemetry → ingestion → cache maintenance → store (if owned) → cluster
//! ```
//!
//! A store handed in through [`ClientBuilder::store`] belongs to the caller
//! and is never closed by the client; one handed in through
//! [`ClientBuilder::owned_store`] is closed like a pool the client opened.
//! A failed build releases whatever it had already started in the same order.

use prometheus::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::{CacheCollector, CacheMaintenance, CacheSet};
use crate::cluster::ClusterCoordinator;
use crate::config::Config;
use crate::dbmetrics::DatabaseMetrics;
use crate::error::{Error, Result};
use crate::health::{self, HealthCounters, HealthMonitor};
use crate::ingestion::{
    IngestReport, IngestionCollector, IngestionCoordinator, IngestionStats, IngestorConfig,
};
use crate::metrics::init_statement_cache_metrics;
use crate::query::QueryEngine;
use crate::resolver::LabelResolver;
use crate::store::{ConnectHook, InstrumentedStore, PgStore, Store, StoreRole};
use crate::telemetry::Telemetry;
use crate::types::{InstanceId, ReadRequest, ReadResponse, TraceBatch, WriteRequest};

/// Write side of the client
enum Ingestion {
    Enabled(Arc<IngestionCoordinator>),
    ReadOnly,
}

/// Builder for [`Client`]
pub struct ClientBuilder {
    config: Config,
    instance_id: Option<InstanceId>,
    store: Option<(Arc<dyn Store>, bool)>,
    connect_hook: Option<ConnectHook>,
    read_only: Option<bool>,
    cluster: Option<Arc<dyn ClusterCoordinator>>,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            instance_id: None,
            store: None,
            connect_hook: None,
            read_only: None,
            cluster: None,
        }
    }

    /// Process instance id; a fresh one is generated when unset
    pub fn instance_id(mut self, id: InstanceId) -> Self {
        self.instance_id = Some(id);
        self
    }

    /// Use an existing store instead of connecting; the client will not close it
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some((store, false));
        self
    }

    /// Hand a store over to the client, which closes it on `close` or on a failed build
    pub fn owned_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some((store, true));
        self
    }

    /// Run `hook` on every new database connection
    pub fn connect_hook(mut self, hook: ConnectHook) -> Self {
        self.connect_hook = Some(hook);
        self
    }

    /// Override `read_only` from the config
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    /// Cluster coordination service to shut down with the client
    pub fn cluster(mut self, cluster: Arc<dyn ClusterCoordinator>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Build the client, releasing anything already created if a step fails
    pub async fn build(self) -> Result<Client> {
        let config = self.config;
        config.validate().map_err(Error::Configuration)?;
        let read_only = self.read_only.unwrap_or(config.read_only);
        let instance_id = self.instance_id.unwrap_or_else(InstanceId::generate);
        let counts = config.database.num_connections(config.ingest.num_copiers)?;

        // store
        let (store, owns_store): (Arc<dyn Store>, bool) = match self.store {
            Some(supplied) => supplied,
            None => {
                let pg = PgStore::connect(&config.database, config.ingest.num_copiers, self.connect_hook)
                    .await?;
                (Arc::new(pg), true)
            },
        };
        let mut guard = BuildGuard {
            store: Some((Arc::clone(&store), owns_store)),
            maintenance: None,
            ingestion: None,
        };

        // caches
        let caches = CacheSet::new(&config.cache);
        let maintenance = Arc::new(CacheMaintenance::start(
            caches.clone(),
            Arc::clone(&store),
            config.cache.series_epoch_poll(),
        ));
        guard.maintenance = Some(Arc::clone(&maintenance));

        // resolver, shared by both connection roles
        let write_store: Arc<dyn Store> =
            Arc::new(InstrumentedStore::new(Arc::clone(&store), StoreRole::Write));
        let read_store: Arc<dyn Store> =
            Arc::new(InstrumentedStore::new(Arc::clone(&store), StoreRole::Read));
        let resolver = LabelResolver::new(Arc::clone(&write_store), Arc::clone(&caches.labels));
        let query = QueryEngine::new(
            Arc::clone(&read_store),
            resolver.with_store(Arc::clone(&read_store)),
        );

        // ingestion
        let ingestion = if read_only {
            info!("read-only client, ingestion disabled");
            Ingestion::ReadOnly
        } else {
            let ingestor_config = IngestorConfig::from_config(&config.ingest, counts.num_copiers);
            let coordinator = match IngestionCoordinator::new(
                ingestor_config,
                Arc::clone(&write_store),
                caches.clone(),
                resolver,
            ) {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    error!(error = %e, "starting ingestion coordinator");
                    guard.release().await;
                    return Err(e);
                },
            };
            guard.ingestion = Some(Arc::clone(&coordinator));
            Ingestion::Enabled(coordinator)
        };

        // the store must answer before background loops start
        if let Err(e) = health::check(read_store.as_ref()).await {
            error!(error = %e, "store unreachable at startup");
            guard.release().await;
            return Err(Error::Connect(e.to_string()));
        }

        // metrics and health
        let registry = Registry::new();
        let health_counters = match init_client_metrics(&registry, &caches, &ingestion)
            .and_then(|_| {
                let counters = HealthCounters::new()?;
                counters.register(&registry)?;
                Ok(counters)
            }) {
            Ok(counters) => counters,
            Err(e) => {
                guard.release().await;
                return Err(Error::Configuration(format!("registering client metrics: {}", e)));
            },
        };
        let db_metrics = match DatabaseMetrics::new(Arc::clone(&read_store))
            .and_then(|m| m.register(&registry).map(|_| m))
        {
            Ok(m) => m,
            Err(e) => {
                guard.release().await;
                return Err(Error::Configuration(format!("registering database metrics: {}", e)));
            },
        };
        let health_token = CancellationToken::new();
        let health = HealthMonitor::start(
            Arc::clone(&read_store),
            config.health.interval(),
            health_counters,
            health_token.clone(),
        );

        // telemetry
        let telemetry = Telemetry::new(
            &config.telemetry,
            instance_id,
            Arc::clone(&write_store),
            caches.clone(),
        )
        .await;
        telemetry.start();

        guard.disarm();
        info!(
            %instance_id,
            read_only,
            num_copiers = counts.num_copiers,
            telemetry = telemetry.is_active(),
            "client started"
        );

        Ok(Client {
            instance_id,
            store,
            owns_store,
            read_store,
            caches,
            maintenance,
            ingestion,
            query,
            health_token,
            health,
            telemetry,
            db_metrics,
            cluster: self.cluster,
            registry,
            closed: AtomicBool::new(false),
        })
    }
}

/// Releases partially built subsystems in shutdown order
///
/// The cluster service is left alone: until `build` succeeds the caller still owns it.
struct BuildGuard {
    store: Option<(Arc<dyn Store>, bool)>,
    maintenance: Option<Arc<CacheMaintenance>>,
    ingestion: Option<Arc<IngestionCoordinator>>,
}

impl BuildGuard {
    async fn release(&mut self) {
        if let Some(ingestion) = self.ingestion.take() {
            ingestion.close().await;
        }
        if let Some(maintenance) = self.maintenance.take() {
            maintenance.stop().await;
        }
        if let Some((store, true)) = self.store.take() {
            store.close().await;
        }
    }

    fn disarm(&mut self) {
        self.store = None;
        self.maintenance = None;
        self.ingestion = None;
    }
}

/// Register cache and ingestion collectors on a client registry
fn init_client_metrics(
    registry: &Registry,
    caches: &CacheSet,
    ingestion: &Ingestion,
) -> prometheus::Result<()> {
    init_statement_cache_metrics();
    registry.register(Box::new(CacheCollector::new(caches.clone())?))?;
    if let Ingestion::Enabled(coordinator) = ingestion {
        registry.register(Box::new(IngestionCollector::new(coordinator.metrics())?))?;
    }
    Ok(())
}

/// Storage client
pub struct Client {
    instance_id: InstanceId,
    store: Arc<dyn Store>,
    owns_store: bool,
    read_store: Arc<dyn Store>,
    caches: CacheSet,
    maintenance: Arc<CacheMaintenance>,
    ingestion: Ingestion,
    query: QueryEngine,
    health_token: CancellationToken,
    health: HealthMonitor,
    telemetry: Telemetry,
    db_metrics: DatabaseMetrics,
    cluster: Option<Arc<dyn ClusterCoordinator>>,
    registry: Registry,
    closed: AtomicBool,
}

impl Client {
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    fn coordinator(&self) -> Result<&IngestionCoordinator> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        match &self.ingestion {
            Ingestion::Enabled(coordinator) => Ok(coordinator.as_ref()),
            Ingestion::ReadOnly => Err(Error::ReadOnly),
        }
    }

    /// Write a batch of series
    pub async fn ingest(&self, request: WriteRequest) -> Result<IngestReport> {
        self.coordinator()?.ingest(request).await
    }

    /// Write a batch of spans
    pub async fn ingest_traces(&self, batch: TraceBatch) -> Result<()> {
        self.coordinator()?.ingest_traces(batch).await
    }

    /// Answer a read request; an absent request yields an empty response
    pub async fn read(&self, request: Option<ReadRequest>) -> Result<ReadResponse> {
        if request.is_none() {
            return Ok(ReadResponse::default());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.query.read(request).await
    }

    /// One-shot store probe
    pub async fn health_check(&self) -> Result<()> {
        health::check(self.read_store.as_ref()).await?;
        Ok(())
    }

    pub fn num_cached_metric_names(&self) -> usize {
        self.caches.metrics.len()
    }

    pub fn metric_names_cache_capacity(&self) -> usize {
        self.caches.metrics.cap()
    }

    pub fn num_cached_labels(&self) -> usize {
        self.caches.labels.len()
    }

    pub fn labels_cache_capacity(&self) -> usize {
        self.caches.labels.cap()
    }

    pub fn num_cached_series(&self) -> usize {
        self.caches.series.len()
    }

    pub fn series_cache_capacity(&self) -> usize {
        self.caches.series.cap()
    }

    /// Per-client metrics: cache sizes, ingestion, health checks, database gauges
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.ingestion, Ingestion::ReadOnly)
    }

    pub fn telemetry_active(&self) -> bool {
        self.telemetry.is_active()
    }

    /// Database gauges; call [`DatabaseMetrics::update`] to refresh
    pub fn database_metrics(&self) -> &DatabaseMetrics {
        &self.db_metrics
    }

    /// Ingestion counters, `None` on a read-only client
    pub fn ingestion_stats(&self) -> Option<IngestionStats> {
        match &self.ingestion {
            Ingestion::Enabled(coordinator) => Some(coordinator.stats()),
            Ingestion::ReadOnly => None,
        }
    }

    /// Shut every subsystem down in order; later calls are no-ops
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down client");

        self.health_token.cancel();
        self.health.stop().await;
        self.telemetry.stop().await;
        if let Ingestion::Enabled(coordinator) = &self.ingestion {
            coordinator.close().await;
        }
        self.maintenance.stop().await;
        if self.owns_store {
            self.store.close().await;
        } else {
            info!("store supplied by caller, leaving it open");
        }
        if let Some(cluster) = &self.cluster {
            cluster.close().await;
        }
        info!("client closed");
    }
}

impl Drop for Client {
    /// Health, telemetry and cache maintenance loops are cancelled here and
    /// copy workers exit once their queues drop; none of them is joined.
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!("client dropped without close; background tasks are cancelled but not joined");
            self.health_token.cancel();
        }
    }
}
