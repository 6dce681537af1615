//! Telemetry engine
//!
//! Periodically writes a [`TelemetryReport`] for this process through the
//! store. When the store cannot hold reports, or telemetry is disabled, the
//! client runs [`Telemetry::Noop`] instead so nothing else has to care.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheSet;
use crate::config::TelemetryConfig;
use crate::error::{Error, Result};
use crate::metrics::SAMPLES_INGESTED_TOTAL;
use crate::store::Store;
use crate::types::InstanceId;

/// Upper bound on how long `stop` waits for the loop
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// One telemetry record, keyed by instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub instance_id: InstanceId,
    pub samples_ingested: u64,
    pub series_cached: u64,
    pub uptime_secs: u64,
}

/// Reporter lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryState {
    Uninitialized,
    Running,
    Stopped,
}

enum Lifecycle {
    Uninitialized,
    Running {
        token: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Active telemetry reporter
pub struct TelemetryReporter {
    instance_id: InstanceId,
    interval: Duration,
    store: Arc<dyn Store>,
    caches: CacheSet,
    started_at: Instant,
    lifecycle: Mutex<Lifecycle>,
}

impl TelemetryReporter {
    /// Create a reporter; fails when disabled or when the store cannot hold reports
    pub async fn new(
        config: &TelemetryConfig,
        instance_id: InstanceId,
        store: Arc<dyn Store>,
        caches: CacheSet,
    ) -> Result<Self> {
        if !config.enabled {
            return Err(Error::Configuration("telemetry disabled".to_string()));
        }
        if !store.supports_telemetry().await? {
            return Err(Error::Configuration(format!(
                "store {} does not support telemetry",
                store.name()
            )));
        }
        Ok(Self {
            instance_id,
            interval: config.interval(),
            store,
            caches,
            started_at: Instant::now(),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
        })
    }

    /// Current report contents
    pub fn report(&self) -> TelemetryReport {
        build_report(self.instance_id, &self.caches, self.started_at)
    }

    /// Start the reporting loop; only the first call has an effect
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Uninitialized) {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.instance_id,
            Arc::clone(&self.store),
            self.caches.clone(),
            self.started_at,
            self.interval,
            token.clone(),
        ));
        *lifecycle = Lifecycle::Running { token, handle };
        info!(instance_id = %self.instance_id, "telemetry started");
    }

    /// Stop the loop, waiting at most a few seconds for it to exit
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        let Lifecycle::Running { token, handle } = previous else {
            return;
        };
        token.cancel();
        let abort = handle.abort_handle();
        match tokio::time::timeout(STOP_TIMEOUT, handle).await {
            Ok(Ok(())) => debug!("telemetry stopped"),
            Ok(Err(e)) => warn!(error = %e, "telemetry task failed"),
            Err(_) => {
                abort.abort();
                warn!("telemetry did not stop in time, aborted");
            },
        }
    }

    pub fn state(&self) -> TelemetryState {
        match *self.lifecycle.lock() {
            Lifecycle::Uninitialized => TelemetryState::Uninitialized,
            Lifecycle::Running { .. } => TelemetryState::Running,
            Lifecycle::Stopped => TelemetryState::Stopped,
        }
    }
}

impl Drop for TelemetryReporter {
    fn drop(&mut self) {
        // the loop exits on its next wakeup and releases its store handle
        if let Lifecycle::Running { token, .. } = &*self.lifecycle.lock() {
            token.cancel();
        }
    }
}

fn build_report(instance_id: InstanceId, caches: &CacheSet, started_at: Instant) -> TelemetryReport {
    TelemetryReport {
        instance_id,
        samples_ingested: SAMPLES_INGESTED_TOTAL.get(),
        series_cached: caches.series.len() as u64,
        uptime_secs: started_at.elapsed().as_secs(),
    }
}

async fn run(
    instance_id: InstanceId,
    store: Arc<dyn Store>,
    caches: CacheSet,
    started_at: Instant,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = build_report(instance_id, &caches, started_at);
        if let Err(e) = store.write_telemetry(&report).await {
            warn!(error = %e, "writing telemetry report");
        }
    }
}

/// Telemetry as seen by the client: a running reporter or nothing at all
pub enum Telemetry {
    Active(TelemetryReporter),
    Noop,
}

impl Telemetry {
    /// Build the active engine, degrading to [`Telemetry::Noop`] on any failure
    pub async fn new(
        config: &TelemetryConfig,
        instance_id: InstanceId,
        store: Arc<dyn Store>,
        caches: CacheSet,
    ) -> Self {
        match TelemetryReporter::new(config, instance_id, store, caches).await {
            Ok(reporter) => Telemetry::Active(reporter),
            Err(e) => {
                debug!(error = %e, "telemetry unavailable, using no-op engine");
                Telemetry::Noop
            },
        }
    }

    pub fn start(&self) {
        if let Telemetry::Active(reporter) = self {
            reporter.start();
        }
    }

    pub async fn stop(&self) {
        if let Telemetry::Active(reporter) = self {
            reporter.stop().await;
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Telemetry::Active(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::MemoryStore;

    fn config(interval_secs: u64) -> TelemetryConfig {
        TelemetryConfig {
            enabled: true,
            interval_secs,
        }
    }

    #[tokio::test]
    async fn test_unsupported_store_degrades_to_noop() {
        let store = Arc::new(MemoryStore::new().with_telemetry(false));
        let telemetry = Telemetry::new(
            &config(1),
            InstanceId::generate(),
            store,
            CacheSet::new(&CacheConfig::default()),
        )
        .await;
        assert!(!telemetry.is_active());
        telemetry.start();
        telemetry.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_degrades_to_noop() {
        let store = Arc::new(MemoryStore::new());
        let disabled = TelemetryConfig {
            enabled: false,
            ..config(1)
        };
        let telemetry = Telemetry::new(
            &disabled,
            InstanceId::generate(),
            store,
            CacheSet::new(&CacheConfig::default()),
        )
        .await;
        assert!(!telemetry.is_active());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let store = Arc::new(MemoryStore::new());
        let reporter = TelemetryReporter::new(
            &config(1),
            InstanceId::generate(),
            store,
            CacheSet::new(&CacheConfig::default()),
        )
        .await
        .unwrap();
        assert_eq!(reporter.state(), TelemetryState::Uninitialized);
        reporter.stop().await;
        assert_eq!(reporter.state(), TelemetryState::Stopped);
        // stopped reporters cannot be restarted
        reporter.start();
        assert_eq!(reporter.state(), TelemetryState::Stopped);
    }

    #[tokio::test]
    async fn test_reports_are_tagged_with_instance_id() {
        let store = Arc::new(MemoryStore::new());
        let id = InstanceId::generate();
        let reporter = TelemetryReporter::new(
            &config(3600),
            id,
            store.clone(),
            CacheSet::new(&CacheConfig::default()),
        )
        .await
        .unwrap();
        reporter.start();
        assert_eq!(reporter.state(), TelemetryState::Running);

        // the first tick fires immediately
        for _ in 0..50 {
            if !store.telemetry_reports().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        reporter.stop().await;

        let reports = store.telemetry_reports();
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|r| r.instance_id == id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_running_reporter_ends_loop() {
        let store = Arc::new(MemoryStore::new());
        let reporter = TelemetryReporter::new(
            &config(1),
            InstanceId::generate(),
            store.clone(),
            CacheSet::new(&CacheConfig::default()),
        )
        .await
        .unwrap();
        reporter.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(reporter);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let at_drop = store.telemetry_reports().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.telemetry_reports().len(), at_drop);
        assert_eq!(Arc::strong_count(&store), 1);
    }
}
