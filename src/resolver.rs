//! Label resolution through the label cache
//!
//! Serves both paths: ingestion creates missing label pairs, queries only
//! look them up. Misses within one call are resolved with a single store
//! round trip.

use std::sync::Arc;

use crate::cache::LabelCache;
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Label, LabelId};

/// Label -> id resolver backed by the shared label cache
#[derive(Clone)]
pub struct LabelResolver {
    store: Arc<dyn Store>,
    cache: Arc<LabelCache>,
}

impl LabelResolver {
    /// Create a resolver over a store handle and the label cache
    pub fn new(store: Arc<dyn Store>, cache: Arc<LabelCache>) -> Self {
        Self { store, cache }
    }

    /// Same cache, different store handle
    pub fn with_store(&self, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: Arc::clone(&self.cache),
        }
    }

    /// Ids for every label, creating missing pairs; output follows input order
    pub async fn resolve(&self, labels: &[Label]) -> Result<Vec<LabelId>, StoreError> {
        let mut ids: Vec<Option<LabelId>> = labels.iter().map(|l| self.cache.get(l)).collect();
        let misses: Vec<Label> = labels
            .iter()
            .zip(&ids)
            .filter(|(_, id)| id.is_none())
            .map(|(l, _)| l.clone())
            .collect();

        if !misses.is_empty() {
            let fetched = self.store.get_or_create_labels(&misses).await?;
            if fetched.len() != misses.len() {
                return Err(StoreError::Query(format!(
                    "store returned {} ids for {} labels",
                    fetched.len(),
                    misses.len()
                )));
            }
            let mut fetched = misses.into_iter().zip(fetched);
            for slot in ids.iter_mut().filter(|id| id.is_none()) {
                if let Some((label, id)) = fetched.next() {
                    self.cache.insert(label, id);
                    *slot = Some(id);
                }
            }
        }

        ids.into_iter()
            .zip(labels)
            .map(|(id, label)| {
                id.ok_or_else(|| {
                    StoreError::Query(format!("label {}={} was not resolved", label.name, label.value))
                })
            })
            .collect()
    }

    /// Ids for labels known to the store; unknown pairs are `None` and are not created
    pub async fn lookup(&self, labels: &[Label]) -> Result<Vec<Option<LabelId>>, StoreError> {
        let mut ids: Vec<Option<LabelId>> = labels.iter().map(|l| self.cache.get(l)).collect();
        let misses: Vec<Label> = labels
            .iter()
            .zip(&ids)
            .filter(|(_, id)| id.is_none())
            .map(|(l, _)| l.clone())
            .collect();
        if misses.is_empty() {
            return Ok(ids);
        }

        let fetched = self.store.lookup_labels(&misses).await?;
        let mut fetched = misses.into_iter().zip(fetched);
        for slot in ids.iter_mut().filter(|id| id.is_none()) {
            if let Some((label, found)) = fetched.next() {
                if let Some(id) = found {
                    self.cache.insert(label, id);
                }
                *slot = found;
            }
        }
        Ok(ids)
    }

    /// The label cache this resolver fills
    pub fn cache(&self) -> &Arc<LabelCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::IdentifierCache;
    use crate::store::MemoryStore;

    fn resolver(store: Arc<MemoryStore>) -> LabelResolver {
        LabelResolver::new(store, Arc::new(IdentifierCache::new("label", 100)))
    }

    #[tokio::test]
    async fn test_second_resolve_is_served_from_cache() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let labels = vec![Label::new("job", "api"), Label::new("env", "prod")];

        let first = resolver.resolve(&labels).await.unwrap();
        let calls = store.calls().labels;
        let second = resolver.resolve(&labels).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.calls().labels, calls);
        assert_eq!(resolver.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_hits_keep_input_order() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let b = resolver.resolve(&[Label::new("b", "2")]).await.unwrap()[0];

        let ids = resolver
            .resolve(&[Label::new("a", "1"), Label::new("b", "2"), Label::new("c", "3")])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[1], b);
        assert_ne!(ids[0], ids[2]);
    }

    #[tokio::test]
    async fn test_lookup_does_not_create() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let known = resolver.resolve(&[Label::new("job", "api")]).await.unwrap()[0];

        let found = resolver
            .lookup(&[Label::new("job", "api"), Label::new("job", "missing")])
            .await
            .unwrap();
        assert_eq!(found, vec![Some(known), None]);

        let again = resolver.lookup(&[Label::new("job", "missing")]).await.unwrap();
        assert_eq!(again, vec![None]);
        assert_eq!(resolver.cache().len(), 1);
    }
}
