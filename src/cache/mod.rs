//! # Query-Result Caching Layer
//!
//! Caches the rows a query returned and drops them again as soon as any of
//! those rows (or a row they reference) is written.
//!
//! ## Features
//!
//! - **Deterministic Keys**: normalized SQL plus parameters hashed with SHA-256
//! - **Flush Lists**: per-object sets of the query keys that returned it,
//!   expiring with their longest-lived member
//! - **Precise Invalidation**: a write drains exactly the affected flush lists,
//!   following foreign-key dependents transitively
//! - **Tombstones**: invalidated keys are overwritten with a short-lived
//!   sentinel instead of deleted, so a racing reader cannot pin stale rows
//! - **Record Reuse**: `execute_by_id` caches rows individually and loads
//!   only the ones no earlier query cached
//! - **Degrading Store**: a cache outage turns into misses, never errors
//! - **Pluggable Backends**: in-process LRU store, Redis behind the `redis`
//!   feature, and an optional separate backend for flush lists
//!
//! ## Example
//!
//! ```rust
//! use futures::stream;
//! use ouroboros_cache::cache::{
//!     CacheConfig, CacheableEntity, MemoryBackend, QueryCache, QueryFingerprint, QueryOptions,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Widget {
//!     id: u64,
//!     color: String,
//! }
//!
//! impl CacheableEntity for Widget {
//!     fn table(&self) -> &str {
//!         "widget"
//!     }
//!
//!     fn primary_key(&self) -> Option<String> {
//!         Some(self.id.to_string())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = QueryCache::new(CacheConfig::default(), Arc::new(MemoryBackend::new()))?;
//! let query = QueryFingerprint::new("SELECT * FROM widget WHERE color = ?").param("red");
//!
//! let rows = cache
//!     .execute(
//!         &query,
//!         || stream::iter(vec![Widget { id: 1, color: "red".into() }]),
//!         QueryOptions::new(),
//!     )
//!     .await
//!     .into_rows()
//!     .await;
//! assert_eq!(rows.len(), 1);
//!
//! // After widget 1 is written
//! cache.invalidate(&cache.codec().object_key("widget", "1")?, &[]).await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod entity;
pub mod entry;
pub mod flush;
pub mod invalidation;
pub mod keys;
pub mod manual;
pub mod query;
pub mod store;
pub mod types;

#[cfg(feature = "redis")]
pub use backend::RedisBackend;
pub use backend::{memory::start_auto_cleanup, CacheBackend, MemoryBackend, MemoryLimits};
pub use config::{CacheConfig, CacheConfigBuilder, InvalidateOnCreate};
pub use entity::{CacheableEntity, EntityIdentity};
pub use entry::{CacheEntry, ListEntry};
pub use flush::{FlushListManager, FlushMapping};
pub use invalidation::{
    spawn_write_listener, InvalidationEvent, InvalidationReason, Invalidator, WriteEvent,
};
pub use keys::{KeyCodec, ObjectRef, QueryFingerprint};
pub use manual::ManualCache;
pub use query::{CachedQueryResult, QueryCache, QueryOptions, QueryStream};
pub use store::{CacheStore, Lookup};
pub use types::{CacheKey, CacheStats, CacheTimeout, CacheValue, Ttl};
