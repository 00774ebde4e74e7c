//! Manual memoization on top of the cache store
//!
//! `cached` never registers a flush list: the entry lives until its TTL runs
//! out or it is deleted. `cached_with` additionally hangs the entry off an
//! owner's flush list so invalidating the owner drops it.
//!
//! Neither call is mutually exclusive. Two tasks missing on the same key may
//! both compute and both write; the last write wins, so `compute` should be
//! idempotent.

use crate::cache::{
    config::CacheConfig,
    flush::FlushListManager,
    keys::KeyCodec,
    store::CacheStore,
    types::{CacheKey, CacheTimeout},
};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Memoizes arbitrary computations
#[derive(Debug, Clone)]
pub struct ManualCache {
    config: Arc<CacheConfig>,
    codec: KeyCodec,
    store: CacheStore,
    flush: FlushListManager,
}

impl ManualCache {
    pub fn new(config: Arc<CacheConfig>, store: CacheStore) -> Self {
        let flush = if config.invalidation_enabled {
            FlushListManager::new(store.clone())
        } else {
            FlushListManager::disabled(store.clone())
        };

        Self {
            codec: KeyCodec::from_config(&config),
            config,
            store,
            flush,
        }
    }

    /// Key a value cached under `name` is stored at
    pub fn key_for(&self, name: &str) -> CacheKey {
        self.codec.function_key(name)
    }

    /// Return the value cached under `name`, computing and storing it on a
    /// miss
    pub async fn cached<T, F, Fut>(&self, name: &str, timeout: CacheTimeout, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = self.codec.function_key(name);
        self.get_or_compute(&key, timeout, compute).await
    }

    /// Like [`cached`](Self::cached), but the entry is also dropped when
    /// `owner_flush_key` (an object or query flush list) is invalidated
    pub async fn cached_with<T, F, Fut>(
        &self,
        owner_flush_key: &str,
        name: &str,
        timeout: CacheTimeout,
        compute: F,
    ) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = self
            .codec
            .function_key(&format!("{}:{}", name, owner_flush_key));

        if let Some(ttl) = timeout.resolve(self.config.default_ttl) {
            self.flush
                .register(&[owner_flush_key.to_string()], &key, ttl)
                .await;
        }

        self.get_or_compute(&key, timeout, compute).await
    }

    /// Evict the value cached under `name`
    pub async fn delete(&self, name: &str) -> bool {
        let key = self.codec.function_key(name);
        debug!("Deleting manual cache entry {}", key);
        self.store.delete(&key).await
    }

    async fn get_or_compute<T, F, Fut>(&self, key: &str, timeout: CacheTimeout, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ttl = match timeout.resolve(self.config.default_ttl) {
            Some(ttl) => ttl,
            None => return compute().await,
        };

        if let Some(value) = self.store.get_decoded::<T>(key).await {
            debug!("Manual cache hit: {}", key);
            return value;
        }

        let value = compute().await;
        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                self.store.set(key, bytes, ttl).await;
            }
            Err(e) => warn!("Value for {} could not be encoded: {}", key, e),
        }
        value
    }
}
