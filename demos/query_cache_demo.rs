//! Query Cache Demo Application
//!
//! Caches a query, invalidates it through the write listener, and shows the
//! miss/hit cycle along the way.
//!
//! Usage:
//!   cargo run --example query_cache_demo
//!   RUST_LOG=ouroboros_cache=debug cargo run --example query_cache_demo
//!
//! Environment variables (also read from `.env`):
//!   CACHE_PREFIX, CACHE_DEFAULT_TTL, CACHE_COUNT_TIMEOUT, CACHE_EMPTY_QUERYSETS,
//!   CACHE_INVALIDATE_ON_CREATE, CACHE_MACHINE_NO_INVALIDATION, CACHE_TOMBSTONE_TTL

use futures::stream;
use ouroboros_cache::cache::start_auto_cleanup;
use ouroboros_cache::{
    spawn_write_listener, CacheConfig, CacheableEntity, MemoryBackend, ObjectRef, QueryCache,
    QueryFingerprint, QueryOptions, WriteEvent,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Addon {
    id: u64,
    name: String,
    author_id: u64,
}

impl CacheableEntity for Addon {
    fn table(&self) -> &str {
        "addons"
    }

    fn primary_key(&self) -> Option<String> {
        Some(self.id.to_string())
    }

    fn references(&self) -> Vec<ObjectRef> {
        vec![ObjectRef::new("users", self.author_id)]
    }
}

/// Stand-in for the database
fn fetch_addons(author_id: u64) -> Vec<Addon> {
    info!("  (executing query against the database)");
    vec![
        Addon {
            id: 1,
            name: "Adblock".into(),
            author_id,
        },
        Addon {
            id: 2,
            name: "Dark Reader".into(),
            author_id,
        },
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("=== Query Cache Demo ===");

    let config = CacheConfig::from_env()?;
    let backend = Arc::new(MemoryBackend::new());
    tokio::spawn(start_auto_cleanup(backend.clone(), Duration::from_secs(30)));

    let cache = QueryCache::new(config, backend.clone())?;
    let query = QueryFingerprint::new("SELECT * FROM addons WHERE author_id = ?").param(7);

    for round in 1..=2 {
        info!("\n--- Round {} ---", round);
        let result = cache
            .execute(&query, || stream::iter(fetch_addons(7)), QueryOptions::new())
            .await;
        let from_cache = result.from_cache();
        let rows = result.into_rows().await;
        info!("{} rows, from cache: {}", rows.len(), from_cache);
    }

    info!("\n--- User 7 renamed; notifying the write listener ---");
    let (tx, rx) = mpsc::channel(64);
    let listener = spawn_write_listener(cache.invalidator().clone(), rx);
    tx.send(WriteEvent::Saved {
        entity: ouroboros_cache::EntityIdentity::new("users", 7),
        created: false,
    })
    .await?;
    drop(tx);
    listener.await?;

    let result = cache
        .execute(&query, || stream::iter(fetch_addons(7)), QueryOptions::new())
        .await;
    info!("After invalidation, from cache: {}", result.from_cache());
    result.into_rows().await;

    info!("\n--- Backend statistics ---");
    info!("{}", backend.stats().await);
    info!("Query cache: {}", cache.stats().await);

    Ok(())
}
