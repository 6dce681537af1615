//! Bounded identifier cache
//!
//! Maps a key (metric name, label pair, canonical label set, metric name for
//! exemplar positions) to the identifier the store assigned it.
//!
//! # Features
//!
//! - LRU eviction once `len() == cap()`; inserting never fails
//! - Thread-safe with a short-held `parking_lot::Mutex`
//! - Misses are not serialized: concurrent misses for the same key may all
//!   reach the store, which must answer them idempotently
//!
//! # Example
//!
//! ```rust
//! use promstore::cache::IdentifierCache;
//!
//! let cache: IdentifierCache<String, i64> = IdentifierCache::new("metric", 2);
//! cache.insert("up".to_string(), 1);
//! cache.insert("down".to_string(), 2);
//! cache.get("up");                      // "up" is now most recent
//! cache.insert("sideways".to_string(), 3); // evicts "down"
//!
//! assert_eq!(cache.len(), 2);
//! assert_eq!(cache.get("down"), None);
//! ```

use lru::LruCache;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hit/miss/eviction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
}

/// LRU cache of store-assigned identifiers
pub struct IdentifierCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Cache name for metrics and logs
    name: &'static str,
    /// Entries in recency order
    entries: Mutex<LruCache<K, V>>,
    /// Maximum number of entries
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> IdentifierCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cache name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Look up a key, marking it most recently used on a hit
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let found = self.entries.lock().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Insert or overwrite an entry, evicting the least recently used one if full
    pub fn insert(&self, key: K, value: V) {
        let evicted = {
            let mut entries = self.entries.lock();
            let replacing = entries.contains(&key);
            entries.push(key, value).is_some() && !replacing
        };
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return the cached id or fetch, cache and return it
    ///
    /// The lock is not held while `fetch` runs.
    pub async fn resolve<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries
    pub fn cap(&self) -> usize {
        self.capacity
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Hit/miss/eviction counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_lru_eviction_order() {
        let cache: IdentifierCache<u32, u32> = IdentifierCache::new("t", 3);
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30);
        assert_eq!(cache.get(&1), Some(10));
        cache.insert(4, 40);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_is_not_eviction() {
        let cache: IdentifierCache<u32, u32> = IdentifierCache::new("t", 1);
        cache.insert(1, 10);
        cache.insert(1, 11);
        assert_eq!(cache.get(&1), Some(11));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_zero_capacity_rounds_up() {
        let cache: IdentifierCache<u32, u32> = IdentifierCache::new("t", 0);
        assert_eq!(cache.cap(), 1);
        cache.insert(1, 1);
        cache.insert(2, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_len_and_cap_do_not_touch_recency() {
        let cache: IdentifierCache<u32, u32> = IdentifierCache::new("t", 2);
        cache.insert(1, 1);
        cache.insert(2, 2);
        let _ = (cache.len(), cache.cap(), cache.stats());
        cache.insert(3, 3);
        assert_eq!(cache.get(&1), None);
    }

    #[tokio::test]
    async fn test_resolve_hits_skip_fetch() {
        let cache: IdentifierCache<String, i64> = IdentifierCache::new("t", 4);
        let fetches = AtomicUsize::new(0);
        for _ in 0..3 {
            let id = cache
                .resolve("up".to_string(), || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .await
                .unwrap();
            assert_eq!(id, 7);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_error_is_not_cached() {
        let cache: IdentifierCache<String, i64> = IdentifierCache::new("t", 4);
        let res = cache
            .resolve("up".to_string(), || async { Err::<i64, _>("boom") })
            .await;
        assert!(res.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_resolution_converges() {
        let cache: Arc<IdentifierCache<String, i64>> = Arc::new(IdentifierCache::new("t", 16));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .resolve("job".to_string(), || async { Ok::<_, ()>(42) })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_len_bounded_by_capacity(cap in 1usize..64, n in 0usize..256) {
            let cache: IdentifierCache<usize, usize> = IdentifierCache::new("p", cap);
            for i in 0..n {
                cache.insert(i, i);
            }
            prop_assert_eq!(cache.len(), n.min(cap));
            // the most recent `min(n, cap)` keys survive
            for i in n.saturating_sub(cap)..n {
                prop_assert_eq!(cache.get(&i), Some(i));
            }
        }
    }
}
