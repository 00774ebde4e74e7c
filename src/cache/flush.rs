//! Flush lists: per-object sets of keys to invalidate when the object changes
//!
//! A flush list holds query keys (results that contained the object) and the
//! flush keys of other objects that depend on it through a foreign key.
//! Lists are an optimization, not an index: a registration racing a drain may
//! be lost, which at worst leaves one stale entry until its TTL runs out.
//! Every registration carries the TTL of what it points at, and the backend
//! keeps the list alive at least that long.

use crate::cache::{
    store::CacheStore,
    types::{CacheKey, Ttl},
};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// `{flush_key: {members}}`
pub type FlushMapping = HashMap<CacheKey, HashSet<CacheKey>>;

/// Maintains flush lists on the store's list backend
#[derive(Debug, Clone)]
pub struct FlushListManager {
    store: CacheStore,
    enabled: bool,
}

impl FlushListManager {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            enabled: true,
        }
    }

    /// A manager whose registrations are dropped; drains still work
    pub fn disabled(store: CacheStore) -> Self {
        Self {
            store,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add `query_key`, cached for `ttl`, to the flush list of every object
    /// key
    pub async fn register<'a, I>(&self, object_keys: I, query_key: &str, ttl: Ttl)
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        let mut mapping = FlushMapping::new();
        for key in object_keys {
            mapping
                .entry(key.clone())
                .or_default()
                .insert(query_key.to_string());
        }
        self.add_to_flush_lists(&mapping, ttl).await;
    }

    /// Record `dependent -> target` edges: draining the target's list will
    /// reach the dependent's list
    pub async fn register_dependents<I>(&self, edges: I, ttl: Ttl)
    where
        I: IntoIterator<Item = (CacheKey, CacheKey)>,
    {
        let mut mapping = FlushMapping::new();
        for (dependent, target) in edges {
            if dependent != target {
                mapping.entry(target).or_default().insert(dependent);
            }
        }
        self.add_to_flush_lists(&mapping, ttl).await;
    }

    /// Merge a mapping into the stored lists. Appends run concurrently.
    pub async fn add_to_flush_lists(&self, mapping: &FlushMapping, ttl: Ttl) {
        if !self.enabled || mapping.is_empty() {
            return;
        }

        let appends = mapping.iter().flat_map(|(list_key, members)| {
            members
                .iter()
                .map(move |member| self.store.add_to_list(list_key, member, ttl))
        });
        let results = join_all(appends).await;

        let failed = results.iter().filter(|ok| !**ok).count();
        debug!(
            "Flush list registration: {} lists, {} appends, {} failed",
            mapping.len(),
            results.len(),
            failed
        );
    }

    /// Atomically read and clear one flush list
    pub async fn drain(&self, flush_key: &str) -> HashSet<CacheKey> {
        self.store.take_list(flush_key).await.into_iter().collect()
    }

    /// Read a flush list without clearing it
    pub async fn members(&self, flush_key: &str) -> HashSet<CacheKey> {
        self.store.get_list(flush_key).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;
    use std::sync::Arc;
    use std::time::Duration;

    const TTL: Ttl = Ttl::After(Duration::from_secs(60));

    fn manager() -> FlushListManager {
        FlushListManager::new(CacheStore::new(Arc::new(MemoryBackend::new())))
    }

    fn keys(names: &[&str]) -> Vec<CacheKey> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_adds_query_to_each_object() {
        let flush = manager();
        let objects = keys(&["o:widget:1", "o:widget:2", "o:widget:3"]);

        flush.register(&objects, "q:red", TTL).await;

        for object in &objects {
            assert_eq!(flush.members(object).await, HashSet::from(["q:red".to_string()]));
        }
    }

    #[tokio::test]
    async fn test_register_collapses_duplicates() {
        let flush = manager();
        let objects = keys(&["o:widget:1"]);

        flush.register(&objects, "q:red", TTL).await;
        flush.register(&objects, "q:red", TTL).await;
        flush.register(&objects, "q:all", TTL).await;

        assert_eq!(flush.members("o:widget:1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_drain_clears() {
        let flush = manager();
        flush.register(&keys(&["o:widget:1"]), "q:red", TTL).await;

        let drained = flush.drain("o:widget:1").await;
        assert!(drained.contains("q:red"));
        assert!(flush.drain("o:widget:1").await.is_empty());
    }

    #[tokio::test]
    async fn test_register_dependents_skips_self_edges() {
        let flush = manager();
        flush
            .register_dependents(
                vec![
                    ("o:addon:1".to_string(), "o:user:7".to_string()),
                    ("o:user:7".to_string(), "o:user:7".to_string()),
                ],
                TTL,
            )
            .await;

        assert_eq!(
            flush.members("o:user:7").await,
            HashSet::from(["o:addon:1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_disabled_manager_ignores_registration() {
        let flush = FlushListManager::disabled(CacheStore::new(Arc::new(MemoryBackend::new())));
        flush.register(&keys(&["o:widget:1"]), "q:red", TTL).await;
        assert!(flush.members("o:widget:1").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_register_and_drain() {
        let flush = Arc::new(manager());
        let mut handles = Vec::new();

        for i in 0..20 {
            let flush = flush.clone();
            handles.push(tokio::spawn(async move {
                flush
                    .register(&vec!["o:widget:1".to_string()], &format!("q:{}", i), TTL)
                    .await;
            }));
        }
        let drainer = {
            let flush = flush.clone();
            tokio::spawn(async move { flush.drain("o:widget:1").await })
        };

        for handle in handles {
            handle.await.unwrap();
        }
        let drained = drainer.await.unwrap();
        let remaining = flush.members("o:widget:1").await;

        // Every registration lands in exactly one place
        assert!(drained.is_disjoint(&remaining));
        assert_eq!(drained.len() + remaining.len(), 20);
    }
}
