//! Cache store adapter
//!
//! Wraps a [`CacheBackend`] and turns every backend failure into a cache miss
//! (reads) or a logged no-op (writes), so a store outage only costs latency.
//! Values are wrapped in a one-byte envelope that separates a tombstone from
//! a missing key.

use crate::cache::{
    backend::CacheBackend,
    types::{CacheKey, CacheValue, Ttl},
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const TAG_TOMBSTONE: u8 = 0;
const TAG_VALUE: u8 = 1;

/// Outcome of a store read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A live value
    Hit(CacheValue),

    /// The key was invalidated recently
    Tombstone,

    /// Nothing stored, expired, undecodable, or the store is down
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_value(self) -> Option<CacheValue> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }
}

fn wrap(value: CacheValue) -> CacheValue {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.push(TAG_VALUE);
    out.extend_from_slice(&value);
    out
}

fn unwrap_envelope(mut raw: CacheValue) -> Option<Lookup> {
    match raw.first().copied() {
        Some(TAG_TOMBSTONE) if raw.len() == 1 => Some(Lookup::Tombstone),
        Some(TAG_VALUE) => {
            raw.remove(0);
            Some(Lookup::Hit(raw))
        }
        _ => None,
    }
}

/// Degrading front for one value backend and (optionally) a separate list
/// backend
#[derive(Debug, Clone)]
pub struct CacheStore {
    values: Arc<dyn CacheBackend>,
    lists: Arc<dyn CacheBackend>,
}

impl CacheStore {
    /// Use one backend for both values and flush lists
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            lists: backend.clone(),
            values: backend,
        }
    }

    /// Keep flush lists on a different backend than values
    pub fn with_list_backend(mut self, lists: Arc<dyn CacheBackend>) -> Self {
        self.lists = lists;
        self
    }

    pub fn value_backend(&self) -> &Arc<dyn CacheBackend> {
        &self.values
    }

    pub fn list_backend(&self) -> &Arc<dyn CacheBackend> {
        &self.lists
    }

    /// Read a key
    pub async fn get(&self, key: &str) -> Lookup {
        match self.values.get(key).await {
            Ok(Some(raw)) => match unwrap_envelope(raw) {
                Some(lookup) => lookup,
                None => {
                    warn!("Discarding malformed cache entry: {}", key);
                    Lookup::Miss
                }
            },
            Ok(None) => Lookup::Miss,
            Err(e) => {
                warn!("Cache read failed for {} ({}): {}", key, self.values.name(), e);
                Lookup::Miss
            }
        }
    }

    /// Read and decode a JSON payload; undecodable payloads count as a miss
    pub async fn get_decoded<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await.into_value()?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cached payload for {} could not be decoded: {}", key, e);
                None
            }
        }
    }

    /// Store a value. Returns whether the write reached the backend.
    pub async fn set(&self, key: &str, value: CacheValue, ttl: Ttl) -> bool {
        match self.values.set(key, wrap(value), ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache write failed for {} ({}): {}", key, self.values.name(), e);
                false
            }
        }
    }

    /// Store a value unless the key already holds a value or a tombstone.
    /// Returns whether the value was written.
    pub async fn add(&self, key: &str, value: CacheValue, ttl: Ttl) -> bool {
        match self.values.add(key, wrap(value), ttl).await {
            Ok(written) => written,
            Err(e) => {
                warn!("Cache add failed for {} ({}): {}", key, self.values.name(), e);
                false
            }
        }
    }

    /// Encode as JSON and store
    pub async fn set_encoded<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Ttl) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, bytes, ttl).await,
            Err(e) => {
                warn!("Value for {} could not be encoded: {}", key, e);
                false
            }
        }
    }

    /// Store several values with one TTL
    pub async fn set_many(&self, entries: Vec<(CacheKey, CacheValue)>, ttl: Ttl) -> bool {
        if entries.is_empty() {
            return true;
        }
        let count = entries.len();
        let wrapped = entries.into_iter().map(|(k, v)| (k, wrap(v))).collect();
        match self.values.set_many(wrapped, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache write of {} entries failed ({}): {}", count, self.values.name(), e);
                false
            }
        }
    }

    /// Overwrite keys with the tombstone sentinel for `ttl`
    pub async fn tombstone_many(&self, keys: &[CacheKey], ttl: Duration) -> bool {
        if keys.is_empty() {
            return true;
        }
        debug!("Tombstoning {} keys", keys.len());
        let entries = keys
            .iter()
            .map(|k| (k.clone(), vec![TAG_TOMBSTONE]))
            .collect();
        match self.values.set_many(entries, Ttl::After(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Tombstone write failed ({}): {}", self.values.name(), e);
                false
            }
        }
    }

    /// Remove a value
    pub async fn delete(&self, key: &str) -> bool {
        match self.values.delete(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache delete failed for {} ({}): {}", key, self.values.name(), e);
                false
            }
        }
    }

    /// Append to a flush list that must outlive a member cached for `ttl`
    pub async fn add_to_list(&self, list_key: &str, value: &str, ttl: Ttl) -> bool {
        match self.lists.add_to_list(list_key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Flush list append failed for {} ({}): {}", list_key, self.lists.name(), e);
                false
            }
        }
    }

    /// Read a flush list; empty when missing or unreachable
    pub async fn get_list(&self, list_key: &str) -> Vec<String> {
        self.lists.get_list(list_key).await.unwrap_or_else(|e| {
            warn!("Flush list read failed for {} ({}): {}", list_key, self.lists.name(), e);
            Vec::new()
        })
    }

    /// Remove a flush list
    pub async fn delete_list(&self, list_key: &str) -> bool {
        match self.lists.delete_list(list_key).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Flush list delete failed for {} ({}): {}", list_key, self.lists.name(), e);
                false
            }
        }
    }

    /// Read and clear a flush list
    pub async fn take_list(&self, list_key: &str) -> Vec<String> {
        self.lists.take_list(list_key).await.unwrap_or_else(|e| {
            warn!("Flush list drain failed for {} ({}): {}", list_key, self.lists.name(), e);
            Vec::new()
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::error::{CacheError, Result};
    use async_trait::async_trait;

    /// Backend that fails every call, standing in for an unreachable server
    #[derive(Debug, Default)]
    pub(crate) struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<CacheValue>> {
            Err(CacheError::StoreUnavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: CacheValue, _ttl: Ttl) -> Result<()> {
            Err(CacheError::StoreUnavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Err(CacheError::StoreUnavailable("connection refused".into()))
        }
        async fn add_to_list(&self, _list_key: &str, _value: &str, _ttl: Ttl) -> Result<()> {
            Err(CacheError::StoreUnavailable("connection refused".into()))
        }
        async fn get_list(&self, _list_key: &str) -> Result<Vec<String>> {
            Err(CacheError::StoreUnavailable("connection refused".into()))
        }
        async fn delete_list(&self, _list_key: &str) -> Result<()> {
            Err(CacheError::StoreUnavailable("connection refused".into()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn memory_store() -> CacheStore {
        CacheStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_hit_miss_tombstone_are_distinct() {
        let store = memory_store();

        assert_eq!(store.get("k").await, Lookup::Miss);

        store.set("k", b"rows".to_vec(), Ttl::Forever).await;
        assert_eq!(store.get("k").await, Lookup::Hit(b"rows".to_vec()));

        store
            .tombstone_many(&["k".to_string()], Duration::from_secs(5))
            .await;
        assert_eq!(store.get("k").await, Lookup::Tombstone);
    }

    #[tokio::test]
    async fn test_add_is_blocked_by_tombstone() {
        let store = memory_store();
        store
            .tombstone_many(&["k".to_string()], Duration::from_millis(50))
            .await;

        assert!(!store.add("k", b"stale".to_vec(), Ttl::Forever).await);
        assert_eq!(store.get("k").await, Lookup::Tombstone);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.add("k", b"fresh".to_vec(), Ttl::Forever).await);
        assert_eq!(store.get("k").await, Lookup::Hit(b"fresh".to_vec()));
    }

    #[tokio::test]
    async fn test_empty_value_is_not_a_tombstone() {
        let store = memory_store();
        store.set("empty", Vec::new(), Ttl::Forever).await;
        assert_eq!(store.get("empty").await, Lookup::Hit(Vec::new()));
    }

    #[tokio::test]
    async fn test_tombstone_expires() {
        let store = memory_store();
        store.set("k", b"rows".to_vec(), Ttl::Forever).await;
        store
            .tombstone_many(&["k".to_string()], Duration::from_millis(50))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("k").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_decode_failure_is_miss() {
        let store = memory_store();
        store.set("k", b"{not json".to_vec(), Ttl::Forever).await;
        assert_eq!(store.get_decoded::<Vec<u32>>("k").await, None);

        store.set_encoded("k", &vec![1u32, 2, 3], Ttl::Forever).await;
        assert_eq!(store.get_decoded::<Vec<u32>>("k").await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_raw_backend_garbage_is_miss() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set("k", vec![9, 9, 9], Ttl::Forever).await.unwrap();

        let store = CacheStore::new(backend);
        assert_eq!(store.get("k").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades() {
        let store = CacheStore::new(Arc::new(DownBackend));

        assert_eq!(store.get("k").await, Lookup::Miss);
        assert!(!store.set("k", b"v".to_vec(), Ttl::Forever).await);
        assert!(!store.add("k", b"v".to_vec(), Ttl::Forever).await);
        assert!(!store.tombstone_many(&["k".to_string()], Duration::from_secs(5)).await);
        assert!(!store.add_to_list("l", "k", Ttl::Forever).await);
        assert!(store.get_list("l").await.is_empty());
        assert!(store.take_list("l").await.is_empty());
    }

    #[tokio::test]
    async fn test_separate_list_backend() {
        let values = Arc::new(MemoryBackend::new());
        let lists = Arc::new(MemoryBackend::new());
        let store = CacheStore::new(values.clone()).with_list_backend(lists.clone());

        store.add_to_list("flush", "q1", Ttl::Forever).await;
        store.set("q1", b"v".to_vec(), Ttl::Forever).await;

        assert_eq!(lists.get_list("flush").await.unwrap(), vec!["q1"]);
        assert!(values.get_list("flush").await.unwrap().is_empty());
        assert_eq!(values.len().await, 1);
        assert_eq!(lists.len().await, 0);
    }
}
