//! # Ouroboros Query Cache (ouroboros-cache)
//!
//! A query-result cache for relational data with precise, flush-list driven
//! invalidation.
//!
//! ## Features
//!
//! - Async-first design using tokio
//! - Result sets cached under a hash of the normalized query
//! - Per-object flush lists recording which cached queries returned the object
//! - Invalidation that follows foreign-key dependents without a table scan
//! - Tombstone writes that keep racing readers from re-caching stale rows
//! - Count caching and manual memoization tied into the same invalidation
//! - In-process LRU backend, Redis backend behind the `redis` feature
//!
//! ## Caching a query
//!
//! ```no_run
//! use futures::stream;
//! use ouroboros_cache::{CacheConfig, MemoryBackend, QueryCache, QueryFingerprint, QueryOptions};
//! # use ouroboros_cache::CacheableEntity;
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # struct Widget { id: u64 }
//! # impl CacheableEntity for Widget {
//! #     fn table(&self) -> &str { "widget" }
//! #     fn primary_key(&self) -> Option<String> { Some(self.id.to_string()) }
//! # }
//! # async fn load_widgets() -> Vec<Widget> { Vec::new() }
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::from_env()?;
//!     let cache = QueryCache::new(config, Arc::new(MemoryBackend::new()))?;
//!
//!     let query = QueryFingerprint::new("SELECT * FROM widget");
//!     let widgets = load_widgets().await;
//!     let result = cache
//!         .execute(&query, move || stream::iter(widgets), QueryOptions::new())
//!         .await;
//!     println!("served from cache: {}", result.from_cache());
//!     let rows = result.into_rows().await;
//!     println!("{} widgets", rows.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Invalidating on write
//!
//! The persistence layer reports committed writes, either by calling
//! [`Invalidator::handle`] directly or through a channel consumed by
//! [`spawn_write_listener`]:
//!
//! ```no_run
//! use ouroboros_cache::{
//!     spawn_write_listener, CacheConfig, EntityIdentity, MemoryBackend, QueryCache, WriteEvent,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = QueryCache::new(CacheConfig::default(), Arc::new(MemoryBackend::new()))?;
//!     let (tx, rx) = mpsc::channel(1024);
//!     let listener = spawn_write_listener(cache.invalidator().clone(), rx);
//!
//!     // addon 1 was updated; it points at user 7
//!     let entity = EntityIdentity::new("addon", 1).references("user", 7);
//!     tx.send(WriteEvent::Saved { entity, created: false }).await?;
//!
//!     drop(tx);
//!     listener.await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    spawn_write_listener, CacheBackend, CacheConfig, CacheConfigBuilder, CacheKey, CacheStats,
    CacheStore, CacheTimeout, CacheValue, CacheableEntity, CachedQueryResult, EntityIdentity,
    InvalidateOnCreate, InvalidationEvent, InvalidationReason, Invalidator, KeyCodec, ManualCache,
    MemoryBackend, ObjectRef, QueryCache, QueryFingerprint, QueryOptions, QueryStream, Ttl,
    WriteEvent,
};
pub use error::{CacheError, Result};
