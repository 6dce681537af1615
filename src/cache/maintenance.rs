//! Background cache maintenance
//!
//! Polls the store's series epoch and clears the series cache when it moves,
//! so recycled series ids are never served from the cache. The task stops when
//! its cancellation token fires; stopping is the client's "close caches"
//! shutdown step.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::CacheSet;
use crate::store::Store;

/// Handle to the running maintenance task
pub struct CacheMaintenance {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CacheMaintenance {
    /// Spawn the maintenance loop
    pub fn start(caches: CacheSet, store: Arc<dyn Store>, poll: Duration) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(caches, store, poll, token.clone()));
        Self {
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the loop and wait for it to exit; later calls are no-ops
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "cache maintenance task failed");
            }
        }
    }

    /// True once `stop` has been requested
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for CacheMaintenance {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(caches: CacheSet, store: Arc<dyn Store>, poll: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_epoch: Option<i64> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match store.series_epoch().await {
            Ok(epoch) => {
                if matches!(last_epoch, Some(prev) if prev != epoch) {
                    let dropped = caches.series.len();
                    caches.series.clear();
                    info!(epoch, dropped, "series epoch advanced, series cache cleared");
                }
                last_epoch = Some(epoch);
            },
            Err(e) => warn!(error = %e, "reading series epoch"),
        }
    }

    debug!("cache maintenance stopped");
}
