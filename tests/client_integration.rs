//! Client lifecycle tests
//!
//! Exercises construction, shutdown ordering and the read/health surface of
//! the client against the in-memory store.

use async_trait::async_trait;
use parking_lot::Mutex;
use promstore::cluster::{ClusterCoordinator, StandaloneCoordinator};
use promstore::dbmetrics::{CHUNKS_CREATED, COMPRESSION_STATUS, WORKER_MAINTENANCE_JOB};
use promstore::store::{MemoryStore, Store};
use promstore::types::{InstrumentationScope, LabelMatcher, Query, ResourceSpans, Sample, Span};
use promstore::{Client, Config, Error, InstanceId, Labels, ReadRequest, TimeSeries, TraceBatch, WriteRequest};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Helper Functions
// =============================================================================

fn config() -> Config {
    let mut config = Config::default();
    config.ingest.num_copiers = 2;
    config
}

async fn client_with(store: Arc<MemoryStore>, config: Config) -> Client {
    Client::builder(config)
        .store(store)
        .build()
        .await
        .expect("client should build")
}

fn write(job: &str, samples: &[(i64, f64)]) -> WriteRequest {
    WriteRequest::new(vec![TimeSeries::new(
        Labels::from_pairs([("__name__", "http_requests_total"), ("job", job)]),
        samples.iter().map(|(t, v)| Sample::new(*t, *v)).collect(),
    )])
}

fn span(id: usize, start_ms: i64) -> Span {
    Span {
        trace_id: format!("{:032x}", id),
        span_id: format!("{:016x}", id),
        parent_span_id: String::new(),
        name: "GET /".to_string(),
        start_time_unix_nano: start_ms * 1_000_000,
        end_time_unix_nano: (start_ms + 5) * 1_000_000,
        attributes: Default::default(),
    }
}

/// Captures the store's state at the moment the cluster service is closed
struct ObservingCoordinator {
    store: Arc<MemoryStore>,
    seen: Mutex<Option<(bool, Vec<&'static str>)>>,
}

impl ObservingCoordinator {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            seen: Mutex::new(None),
        }
    }

    fn seen(&self) -> Option<(bool, Vec<&'static str>)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ClusterCoordinator for ObservingCoordinator {
    async fn close(&self) {
        *self.seen.lock() = Some((self.store.is_closed(), self.store.journal()));
    }
}

/// Config with every background loop ticking once a second
fn fast_loops() -> Config {
    let mut config = config();
    config.health.interval_secs = 1;
    config.telemetry.interval_secs = 1;
    config.cache.series_epoch_poll_secs = 1;
    config
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_new_work() {
    let store = Arc::new(MemoryStore::new());
    let client = client_with(store.clone(), config()).await;

    client.ingest(write("api", &[(1, 1.0)])).await.unwrap();
    client.close().await;
    client.close().await;

    assert!(matches!(
        client.ingest(write("api", &[(2, 1.0)])).await,
        Err(Error::Closed)
    ));
    assert!(matches!(
        client.ingest_traces(TraceBatch::default()).await,
        Err(Error::Closed)
    ));
    // caller-supplied store stays open
    assert!(!store.is_closed());
}

#[tokio::test]
async fn test_cluster_service_is_closed_once() {
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(StandaloneCoordinator::new());
    let client = Client::builder(config())
        .store(store)
        .cluster(cluster.clone())
        .build()
        .await
        .unwrap();

    client.close().await;
    client.close().await;
    assert_eq!(cluster.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_subsystems_in_order() {
    let store = Arc::new(MemoryStore::new().with_copy_latency(Duration::from_secs(3)));
    let cluster = Arc::new(ObservingCoordinator::new(store.clone()));
    let mut config = fast_loops();
    config.ingest.num_copiers = 1;
    config.ingest.async_acks = true;
    let client = Client::builder(config)
        .owned_store(store.clone())
        .cluster(cluster.clone())
        .build()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let running = store.journal();
    for op in ["ping", "write_telemetry", "series_epoch"] {
        assert!(running.contains(&op), "{op} never ran");
    }

    // still copying for three seconds when close starts
    client.ingest(write("api", &[(1, 1.0)])).await.unwrap();
    let mark = store.journal().len();
    client.close().await;

    let during_close = store.journal()[mark..].to_vec();
    let position = |op: &str| during_close.iter().position(|o| *o == op);
    // health and telemetry are stopped before ingestion drains
    assert_eq!(position("ping"), None);
    assert_eq!(position("write_telemetry"), None);
    // cache maintenance keeps polling until the drain is over
    let copy = position("copy").expect("queued batch was drained");
    let epoch = position("series_epoch").expect("maintenance ran during the drain");
    assert!(epoch < copy);
    // then the store, then the cluster service
    assert_eq!(during_close.last(), Some(&"close"));
    let (store_closed, journal) = cluster.seen().expect("cluster service closed");
    assert!(store_closed);
    assert_eq!(journal.len(), mark + during_close.len());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.journal().len(), mark + during_close.len());
}

#[tokio::test(start_paused = true)]
async fn test_drop_without_close_stops_background_tasks() {
    let store = Arc::new(MemoryStore::new());
    let client = client_with(store.clone(), fast_loops()).await;
    client.ingest(write("api", &[(1, 1.0)])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    drop(client);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let at_drop = store.journal().len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.journal().len(), at_drop);
    assert_eq!(Arc::strong_count(&store), 1);
    assert!(!store.is_closed());
}

#[tokio::test]
async fn test_failed_build_releases_owned_store() {
    let store = Arc::new(MemoryStore::new());
    store.set_unreachable(true);
    let cluster = Arc::new(StandaloneCoordinator::new());

    let err = Client::builder(config())
        .owned_store(store.clone())
        .cluster(cluster.clone())
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Connect(_)));
    assert!(store.is_closed());
    assert_eq!(store.journal().last(), Some(&"close"));
    assert_eq!(cluster.close_count(), 0);

    // copy workers and cache maintenance let go of the store
    for _ in 0..50 {
        if Arc::strong_count(&store) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(Arc::strong_count(&store), 1);
}

#[tokio::test]
async fn test_failed_build_leaves_caller_store_open() {
    let store = Arc::new(MemoryStore::new());
    store.set_unreachable(true);
    let err = Client::builder(config()).store(store.clone()).build().await.err().unwrap();
    assert!(matches!(err, Error::Connect(_)));
    assert!(!store.is_closed());
}

#[tokio::test]
async fn test_read_only_client_has_no_ingestion() {
    let store = Arc::new(MemoryStore::new());
    let client = Client::builder(config())
        .store(store.clone())
        .read_only(true)
        .build()
        .await
        .unwrap();

    assert!(client.is_read_only());
    assert!(client.ingestion_stats().is_none());
    assert!(matches!(
        client.ingest(write("api", &[(1, 1.0)])).await,
        Err(Error::ReadOnly)
    ));
    assert!(matches!(
        client.ingest_traces(TraceBatch::default()).await,
        Err(Error::ReadOnly)
    ));
    assert_eq!(store.calls().copies, 0);

    // close skips the missing coordinator
    client.close().await;
}

#[tokio::test]
async fn test_invalid_config_fails_build() {
    let store = Arc::new(MemoryStore::new());
    let mut bad = config();
    bad.database.min_connections = 20;
    bad.database.max_connections = 10;

    let err = Client::builder(bad).store(store).build().await.err().unwrap();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn test_instance_id_is_passed_through() {
    let store = Arc::new(MemoryStore::new());
    let id = InstanceId::generate();
    let client = Client::builder(config())
        .store(store)
        .instance_id(id)
        .build()
        .await
        .unwrap();
    assert_eq!(client.instance_id(), id);
    client.close().await;
}

#[tokio::test]
async fn test_telemetry_falls_back_to_noop() {
    let store = Arc::new(MemoryStore::new().with_telemetry(false));
    let client = client_with(store, config()).await;
    assert!(!client.telemetry_active());
    client.close().await;
}

// =============================================================================
// Read and health
// =============================================================================

#[tokio::test]
async fn test_read_none_returns_empty_response() {
    let store = Arc::new(MemoryStore::new());
    let client = client_with(store, config()).await;
    let response = client.read(None).await.unwrap();
    assert!(response.results.is_empty());
    client.close().await;
}

#[tokio::test]
async fn test_written_samples_are_readable() {
    let store = Arc::new(MemoryStore::new());
    let client = client_with(store, config()).await;
    client
        .ingest(write("api", &[(1000, 1.0), (2000, 2.0)]))
        .await
        .unwrap();
    client.ingest(write("db", &[(1000, 9.0)])).await.unwrap();

    let response = client
        .read(Some(ReadRequest {
            queries: vec![
                Query {
                    start_ms: 0,
                    end_ms: 5000,
                    matchers: vec![LabelMatcher::equal("job", "api")],
                },
                Query {
                    start_ms: 0,
                    end_ms: 5000,
                    matchers: vec![LabelMatcher::equal("__name__", "http_requests_total")],
                },
            ],
        }))
        .await
        .unwrap();

    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].timeseries.len(), 1);
    assert_eq!(response.results[0].timeseries[0].samples.len(), 2);
    assert_eq!(response.results[1].timeseries.len(), 2);
    client.close().await;
}

#[tokio::test]
async fn test_health_check_reports_store_error() {
    let store = Arc::new(MemoryStore::new());
    let client = client_with(store.clone(), config()).await;
    assert!(client.health_check().await.is_ok());

    store.set_unreachable(true);
    assert!(matches!(client.health_check().await, Err(Error::Store(_))));
    store.set_unreachable(false);
    client.close().await;
}

// =============================================================================
// Cache introspection and metrics
// =============================================================================

#[tokio::test]
async fn test_cache_introspection() {
    let store = Arc::new(MemoryStore::new());
    let mut config = config();
    config.cache.metrics_capacity = 2;
    config.cache.labels_capacity = 100;
    let client = client_with(store, config).await;

    assert_eq!(client.num_cached_metric_names(), 0);
    assert_eq!(client.metric_names_cache_capacity(), 2);
    assert_eq!(client.labels_cache_capacity(), 100);

    for name in ["a", "b", "c"] {
        let request = WriteRequest::new(vec![TimeSeries::new(
            Labels::from_pairs([("__name__", name), ("job", "x")]),
            vec![Sample::new(1, 1.0)],
        )]);
        client.ingest(request).await.unwrap();
    }
    assert_eq!(client.num_cached_metric_names(), 2);
    // three names plus one shared job label
    assert_eq!(client.num_cached_labels(), 4);
    assert_eq!(client.num_cached_series(), 3);
    client.close().await;
}

#[tokio::test]
async fn test_registry_exposes_client_metrics() {
    let store = Arc::new(MemoryStore::new());
    let client = client_with(store, config()).await;
    client.ingest(write("api", &[(1, 1.0)])).await.unwrap();

    let names: Vec<String> = client
        .registry()
        .gather()
        .iter()
        .map(|f| f.get_name().to_string())
        .collect();
    for expected in [
        "promstore_cache_elements",
        "promstore_cache_capacity",
        "promstore_client_samples_written",
        "promstore_database_health_checks_total",
        "promstore_sql_database_chunks_created",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
    client.close().await;
}

#[tokio::test]
async fn test_chunks_created_after_trace_ingest() {
    let store = Arc::new(MemoryStore::new().with_compression(true).with_maintenance_jobs(2));
    let client = client_with(store.clone(), config()).await;
    let metrics = client.database_metrics();

    for name in [COMPRESSION_STATUS, WORKER_MAINTENANCE_JOB, CHUNKS_CREATED] {
        assert_eq!(metrics.get_metric(name).unwrap(), 0.0);
    }
    metrics.update().await.unwrap();
    assert_eq!(metrics.get_metric(COMPRESSION_STATUS).unwrap(), 1.0);
    assert_eq!(metrics.get_metric(WORKER_MAINTENANCE_JOB).unwrap(), 2.0);
    assert_eq!(metrics.get_metric(CHUNKS_CREATED).unwrap(), 0.0);

    // one span in each of three consecutive eight hour chunks
    let hour = 60 * 60 * 1000;
    let batch = TraceBatch {
        resource_spans: vec![ResourceSpans {
            resource: Default::default(),
            scope: InstrumentationScope {
                name: "test".to_string(),
                version: "1.0".to_string(),
            },
            spans: vec![span(1, hour), span(2, 9 * hour), span(3, 17 * hour)],
        }],
    };
    client.ingest_traces(batch).await.unwrap();
    assert_eq!(store.span_count(), 3);

    metrics.update().await.unwrap();
    assert_eq!(metrics.get_metric(CHUNKS_CREATED).unwrap(), 3.0);
    client.close().await;
    assert!(!store.is_closed());
    assert!(store.ping().await.is_ok());
}
