//! Series-to-copier partitioning
//!
//! Routes every series of a batch to one copy worker by hashing its
//! canonical label set. The same series always lands on the same worker, so
//! its samples keep their relative order within a batch without any global
//! serialization.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::types::{Labels, TimeSeries};

/// Copy worker index
pub type CopierId = usize;

/// Hash-based partitioner over a fixed number of copiers
#[derive(Debug, Clone, Copy)]
pub struct HashPartitioner {
    /// Number of copy workers
    num_copiers: usize,
}

impl HashPartitioner {
    /// Create a partitioner; zero copiers is treated as one
    pub fn new(num_copiers: usize) -> Self {
        Self {
            num_copiers: num_copiers.max(1),
        }
    }

    /// Number of partitions
    pub fn num_copiers(&self) -> usize {
        self.num_copiers
    }

    /// Copier responsible for a series
    pub fn route(&self, labels: &Labels) -> CopierId {
        let mut hasher = DefaultHasher::new();
        labels.hash(&mut hasher);
        (hasher.finish() as usize) % self.num_copiers
    }

    /// Split series into one bucket per copier, preserving arrival order inside each bucket
    pub fn split(&self, series: Vec<TimeSeries>) -> Vec<Vec<TimeSeries>> {
        let mut buckets: Vec<Vec<TimeSeries>> = (0..self.num_copiers).map(|_| Vec::new()).collect();
        for ts in series {
            let idx = self.route(&ts.labels);
            buckets[idx].push(ts);
        }
        buckets
    }
}
