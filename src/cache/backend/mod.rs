//! Pluggable storage backends
//!
//! Backends report failures faithfully; degrading them into cache misses is
//! the job of [`CacheStore`](crate::cache::store::CacheStore).

use crate::cache::types::{CacheKey, CacheValue, Ttl};
use crate::error::Result;
use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{MemoryBackend, MemoryLimits};
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Key-value store with TTLs and server-side sets ("lists").
///
/// Every operation is atomic at single-key granularity; nothing spans keys.
/// Lists hold unique members; adding an existing member is a no-op. A list
/// expires like a value, and its expiry only ever grows.
#[async_trait]
pub trait CacheBackend: Send + Sync + std::fmt::Debug {
    /// Fetch a value
    async fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    /// Store a value
    async fn set(&self, key: &str, value: CacheValue, ttl: Ttl) -> Result<()>;

    /// Store a value only if the key is absent (a live tombstone counts as
    /// present). Returns whether the value was written.
    ///
    /// The default is a read followed by a write and can race; backends with
    /// a native conditional write should use it.
    async fn add(&self, key: &str, value: CacheValue, ttl: Ttl) -> Result<bool> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    /// Store several values with the same TTL
    async fn set_many(&self, entries: Vec<(CacheKey, CacheValue)>, ttl: Ttl) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Remove a value
    async fn delete(&self, key: &str) -> Result<()>;

    /// Add a member to a list and keep the list alive for at least `ttl`
    async fn add_to_list(&self, list_key: &str, value: &str, ttl: Ttl) -> Result<()>;

    /// Read every member of a list (empty if the list does not exist)
    async fn get_list(&self, list_key: &str) -> Result<Vec<String>>;

    /// Remove a list
    async fn delete_list(&self, list_key: &str) -> Result<()>;

    /// Read and clear a list.
    ///
    /// The default is a read followed by a delete, so a member added in
    /// between is lost. Backends that can do this atomically should.
    async fn take_list(&self, list_key: &str) -> Result<Vec<String>> {
        let members = self.get_list(list_key).await?;
        self.delete_list(list_key).await?;
        Ok(members)
    }

    /// Backend name for logging
    fn name(&self) -> &'static str;
}
