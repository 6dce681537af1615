//! Store health checks
//!
//! [`check`] is a one-shot probe for liveness/readiness endpoints.
//! [`HealthMonitor`] runs the same probe on a fixed interval in the
//! background and only ever records the outcome; a failed probe never stops
//! the loop.

use parking_lot::Mutex;
use prometheus::{IntCounter, Registry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::Store;

/// Probe the store with a trivial round trip, returning its error verbatim
pub async fn check(store: &dyn Store) -> Result<(), StoreError> {
    store.ping().await
}

/// Health check counters, registered on a client's registry
#[derive(Clone)]
pub struct HealthCounters {
    pub checks: IntCounter,
    pub errors: IntCounter,
}

impl HealthCounters {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            checks: IntCounter::new(
                "promstore_database_health_checks_total",
                "Number of database health checks performed",
            )?,
            errors: IntCounter::new(
                "promstore_database_health_check_errors_total",
                "Number of database health check errors",
            )?,
        })
    }

    /// Register both counters
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.checks.clone()))?;
        registry.register(Box::new(self.errors.clone()))?;
        Ok(())
    }
}

/// Background health probe
pub struct HealthMonitor {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: HealthCounters,
}

impl HealthMonitor {
    /// Start probing every `interval` until `token` is cancelled
    pub fn start(
        store: Arc<dyn Store>,
        interval: Duration,
        counters: HealthCounters,
        token: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(run(store, interval, counters.clone(), token.clone()));
        Self {
            token,
            handle: Mutex::new(Some(handle)),
            counters,
        }
    }

    /// Cancel the loop and wait for it; later calls are no-ops
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "health monitor task failed");
            }
        }
    }

    pub fn checks(&self) -> u64 {
        self.counters.checks.get()
    }

    pub fn errors(&self) -> u64 {
        self.counters.errors.get()
    }
}

async fn run(store: Arc<dyn Store>, interval: Duration, counters: HealthCounters, token: CancellationToken) {
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        counters.checks.inc();
        if let Err(e) = check(store.as_ref()).await {
            counters.errors.inc();
            warn!(error = %e, "health check failed");
        }
    }
    debug!("health monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_check_returns_store_error() {
        let store = MemoryStore::new();
        assert!(check(&store).await.is_ok());
        store.set_unreachable(true);
        assert!(matches!(check(&store).await, Err(StoreError::Unreachable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_and_loop_keeps_running() {
        let store = Arc::new(MemoryStore::new());
        store.set_unreachable(true);
        let monitor = HealthMonitor::start(
            store.clone(),
            Duration::from_secs(60),
            HealthCounters::new().unwrap(),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(monitor.checks() >= 2);
        assert_eq!(monitor.errors(), monitor.checks());

        store.set_unreachable(false);
        let failed = monitor.errors();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(monitor.checks() > failed);
        assert_eq!(monitor.errors(), failed);

        monitor.stop().await;
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_stops_loop() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let monitor = HealthMonitor::start(
            store,
            Duration::from_secs(60),
            HealthCounters::new().unwrap(),
            token.clone(),
        );
        token.cancel();
        monitor.stop().await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(monitor.checks(), 0);
    }

    #[test]
    fn test_counters_register_once_per_registry() {
        let registry = Registry::new();
        let counters = HealthCounters::new().unwrap();
        counters.register(&registry).unwrap();
        assert!(counters.register(&registry).is_err());
        assert_eq!(registry.gather().len(), 2);
    }
}
