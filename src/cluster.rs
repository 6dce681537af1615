//! Cluster coordination hook
//!
//! Leader election lives outside this crate. The client only holds the
//! service so it can be shut down last, after the store is closed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// An externally provided cluster coordination service
#[async_trait]
pub trait ClusterCoordinator: Send + Sync + 'static {
    /// Release leases and stop background work
    async fn close(&self);
}

/// Coordinator for a single, unreplicated instance
///
/// Counts `close` calls so shutdown ordering can be observed.
#[derive(Debug, Default)]
pub struct StandaloneCoordinator {
    closes: AtomicUsize,
}

impl StandaloneCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times `close` has been called
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterCoordinator for StandaloneCoordinator {
    async fn close(&self) {
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            info!("standalone coordinator closed");
        }
    }
}
