//! Invalidation engine
//!
//! A write to a row drains the row's flush list, the flush lists of related
//! rows, and every dependent flush list reachable from those, then overwrites
//! each collected cache key with a short-lived tombstone.
//!
//! Tombstones rather than deletes: a reader that fetched the row before the
//! write committed may still populate the key afterwards, but that stale
//! value can only replace the tombstone, so it never outlives the tombstone
//! window by more than one round trip. Store failures are logged and
//! swallowed; the database write has already committed.

use crate::cache::{
    config::{CacheConfig, InvalidateOnCreate},
    entity::{CacheableEntity, EntityIdentity},
    flush::FlushListManager,
    keys::KeyCodec,
    store::CacheStore,
    types::CacheKey,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Existing row updated
    Saved,

    /// New row inserted
    Created,

    /// Row deleted
    Deleted,

    /// Explicit call by application code
    Manual,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Saved => write!(f, "row saved"),
            InvalidationReason::Created => write!(f, "row created"),
            InvalidationReason::Deleted => write!(f, "row deleted"),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
        }
    }
}

/// Record of one invalidation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Keys overwritten with a tombstone
    pub keys: Vec<CacheKey>,

    /// Flush lists drained
    pub flush_lists: Vec<CacheKey>,

    /// Whether the tombstone write reached the store
    pub delivered: bool,
}

impl InvalidationEvent {
    fn new(reason: InvalidationReason) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys: Vec::new(),
            flush_lists: Vec::new(),
            delivered: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.flush_lists.is_empty()
    }
}

/// Write notification from the persistence layer, sent after commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteEvent {
    Saved {
        entity: EntityIdentity,
        created: bool,
    },
    Deleted {
        entity: EntityIdentity,
    },
}

impl WriteEvent {
    pub fn saved<T: CacheableEntity>(row: &T, created: bool) -> Result<Self> {
        Ok(WriteEvent::Saved {
            entity: row.identity()?,
            created,
        })
    }

    pub fn deleted<T: CacheableEntity>(row: &T) -> Result<Self> {
        Ok(WriteEvent::Deleted {
            entity: row.identity()?,
        })
    }
}

/// Computes and applies invalidations
#[derive(Debug, Clone)]
pub struct Invalidator {
    config: Arc<CacheConfig>,
    codec: KeyCodec,
    store: CacheStore,
    flush: FlushListManager,
}

impl Invalidator {
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

    pub fn flush_lists(&self) -> &FlushListManager {
        &self.flush
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Invalidate one object's flush list plus those of related objects
    pub async fn invalidate(&self, object_key: &str, related: &[CacheKey]) -> InvalidationEvent {
        let seeds = std::iter::once(object_key.to_string()).chain(related.iter().cloned());
        self.invalidate_keys(seeds, InvalidationReason::Manual).await
    }

    /// Drain the given flush lists transitively and tombstone what they hold
    pub async fn invalidate_keys<I>(&self, flush_keys: I, reason: InvalidationReason) -> InvalidationEvent
    where
        I: IntoIterator<Item = CacheKey>,
    {
        self.run(flush_keys.into_iter().collect(), Vec::new(), reason)
            .await
    }

    /// Invalidate a written row: its own flush list, its foreign-key targets,
    /// its individually cached record, and (on create, if configured) every
    /// query over its table
    pub async fn invalidate_entity(
        &self,
        entity: &EntityIdentity,
        reason: InvalidationReason,
    ) -> Result<InvalidationEvent> {
        let mut seeds = HashSet::new();
        seeds.insert(self.codec.object_ref_key(&entity.object)?);
        for reference in &entity.references {
            seeds.insert(self.codec.object_ref_key(reference)?);
        }

        if reason == InvalidationReason::Created
            && self.config.invalidate_on_create == InvalidateOnCreate::WholeTable
        {
            seeds.insert(self.codec.model_flush_key(&entity.object.table)?);
        }

        let record = self
            .codec
            .record_key(&entity.object.table, &entity.object.pk)?;

        Ok(self.run(seeds, vec![record], reason).await)
    }

    /// Invalidate rows by value
    pub async fn invalidate_objects<T: CacheableEntity>(&self, rows: &[T]) -> Result<InvalidationEvent> {
        let mut combined = InvalidationEvent::new(InvalidationReason::Manual);
        for row in rows {
            let event = self
                .invalidate_entity(&row.identity()?, InvalidationReason::Manual)
                .await?;
            combined.keys.extend(event.keys);
            combined.flush_lists.extend(event.flush_lists);
            combined.delivered &= event.delivered;
        }
        Ok(combined)
    }

    /// Apply a write notification
    pub async fn handle(&self, event: WriteEvent) -> Result<InvalidationEvent> {
        match event {
            WriteEvent::Saved { entity, created } => {
                let reason = if created {
                    InvalidationReason::Created
                } else {
                    InvalidationReason::Saved
                };
                self.invalidate_entity(&entity, reason).await
            }
            WriteEvent::Deleted { entity } => {
                self.invalidate_entity(&entity, InvalidationReason::Deleted)
                    .await
            }
        }
    }

    async fn run(
        &self,
        seeds: HashSet<CacheKey>,
        extra_keys: Vec<CacheKey>,
        reason: InvalidationReason,
    ) -> InvalidationEvent {
        let mut event = InvalidationEvent::new(reason);

        if !self.config.invalidation_enabled {
            debug!("Invalidation disabled, skipping {} flush lists", seeds.len());
            return event;
        }

        let (mut keys, visited) = self.find_flush_lists(seeds).await;
        keys.extend(extra_keys);

        let mut keys: Vec<CacheKey> = keys.into_iter().collect();
        keys.sort();
        let mut visited: Vec<CacheKey> = visited.into_iter().collect();
        visited.sort();

        event.delivered = self
            .store
            .tombstone_many(&keys, self.config.tombstone_ttl)
            .await;
        if !event.delivered {
            warn!(
                "Invalidation ({}) could not reach the store; {} keys may stay stale until expiry",
                event.reason,
                keys.len()
            );
        }

        info!(
            "Invalidated {} keys from {} flush lists ({})",
            keys.len(),
            visited.len(),
            event.reason
        );

        event.keys = keys;
        event.flush_lists = visited;
        event
    }

    /// Drain flush lists level by level, following members that are
    /// themselves flush keys. Returns (cache keys, drained flush keys).
    async fn find_flush_lists(&self, seeds: HashSet<CacheKey>) -> (HashSet<CacheKey>, HashSet<CacheKey>) {
        let mut visited: HashSet<CacheKey> = HashSet::new();
        let mut found: HashSet<CacheKey> = HashSet::new();
        let mut pending = seeds;

        while !pending.is_empty() {
            visited.extend(pending.iter().cloned());

            let drained = join_all(pending.iter().map(|key| self.flush.drain(key))).await;

            let mut next = HashSet::new();
            for member in drained.into_iter().flatten() {
                if self.codec.is_flush_key(&member) {
                    if !visited.contains(&member) {
                        next.insert(member);
                    }
                } else {
                    found.insert(member);
                }
            }
            pending = next;
        }

        (found, visited)
    }
}

/// Consume write notifications from a channel until every sender is dropped
pub fn spawn_write_listener(
    invalidator: Arc<Invalidator>,
    mut events: mpsc::Receiver<WriteEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Write listener started");
        while let Some(event) = events.recv().await {
            if let Err(e) = invalidator.handle(event).await {
                warn!("Write notification rejected: {}", e);
            }
        }
        info!("Write listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::store::{tests::DownBackend, Lookup};
    use crate::cache::types::Ttl;
    use crate::error::CacheError;
    use std::time::Duration;

    fn setup(config: CacheConfig) -> (Invalidator, CacheStore) {
        let store = CacheStore::new(Arc::new(MemoryBackend::new()));
        (Invalidator::new(Arc::new(config), store.clone()), store)
    }

    fn config() -> CacheConfig {
        CacheConfig::builder().prefix("t").ttl_jitter(0.0).build()
    }

    #[tokio::test]
    async fn test_invalidate_tombstones_drained_queries() {
        let (inv, store) = setup(config());
        let widget = inv.codec().object_key("widget", "2").unwrap();

        store.set("t:q:red", b"[]".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![widget.clone()], "t:q:red", Ttl::Forever).await;

        let event = inv.invalidate(&widget, &[]).await;
        assert_eq!(event.keys, vec!["t:q:red".to_string()]);
        assert_eq!(store.get("t:q:red").await, Lookup::Tombstone);
        assert!(inv.flush_lists().members(&widget).await.is_empty());
    }

    #[tokio::test]
    async fn test_related_keys_are_drained() {
        let (inv, store) = setup(config());
        let widget = inv.codec().object_key("widget", "2").unwrap();
        let maker = inv.codec().object_key("maker", "9").unwrap();

        store.set("t:q:makers", b"[]".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![maker.clone()], "t:q:makers", Ttl::Forever).await;

        let event = inv.invalidate(&widget, &[maker]).await;
        assert!(event.keys.contains(&"t:q:makers".to_string()));
        assert_eq!(store.get("t:q:makers").await, Lookup::Tombstone);
    }

    #[tokio::test]
    async fn test_dependent_flush_lists_are_followed() {
        let (inv, store) = setup(config());
        let addon = inv.codec().object_key("addon", "1").unwrap();
        let user = inv.codec().object_key("user", "7").unwrap();

        store.set("t:q:addons", b"[]".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![addon.clone()], "t:q:addons", Ttl::Forever).await;
        inv.flush_lists()
            .register_dependents(vec![(addon.clone(), user.clone())], Ttl::Forever)
            .await;

        let event = inv.invalidate(&user, &[]).await;
        assert_eq!(event.keys, vec!["t:q:addons".to_string()]);
        assert!(event.flush_lists.contains(&addon));
        assert_eq!(store.get("t:q:addons").await, Lookup::Tombstone);
    }

    #[tokio::test]
    async fn test_cycles_terminate() {
        let (inv, _store) = setup(config());
        let a = inv.codec().object_key("node", "a").unwrap();
        let b = inv.codec().object_key("node", "b").unwrap();

        inv.flush_lists()
            .register_dependents(vec![(a.clone(), b.clone()), (b.clone(), a.clone())], Ttl::Forever)
            .await;
        inv.flush_lists().register(&vec![b.clone()], "t:q:nodes", Ttl::Forever).await;

        let event = inv.invalidate(&a, &[]).await;
        assert_eq!(event.flush_lists.len(), 2);
        assert_eq!(event.keys, vec!["t:q:nodes".to_string()]);
    }

    #[tokio::test]
    async fn test_invalidate_twice_is_idempotent() {
        let (inv, store) = setup(config());
        let widget = inv.codec().object_key("widget", "1").unwrap();

        store.set("t:q:all", b"[]".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![widget.clone()], "t:q:all", Ttl::Forever).await;

        inv.invalidate(&widget, &[]).await;
        let second = inv.invalidate(&widget, &[]).await;

        assert!(second.keys.is_empty());
        assert_eq!(store.get("t:q:all").await, Lookup::Tombstone);
    }

    #[tokio::test]
    async fn test_entity_invalidation_covers_record_and_references() {
        let (inv, store) = setup(config());
        let user = inv.codec().object_key("user", "7").unwrap();
        let record = inv.codec().record_key("addon", "1").unwrap();

        store.set(&record, b"{}".to_vec(), Ttl::Forever).await;
        store.set("t:q:users", b"[]".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![user], "t:q:users", Ttl::Forever).await;

        let entity = EntityIdentity::new("addon", 1).references("user", 7);
        let event = inv
            .handle(WriteEvent::Saved {
                entity,
                created: false,
            })
            .await
            .unwrap();

        assert_eq!(event.reason, InvalidationReason::Saved);
        assert_eq!(store.get(&record).await, Lookup::Tombstone);
        assert_eq!(store.get("t:q:users").await, Lookup::Tombstone);
    }

    #[tokio::test]
    async fn test_invalidate_on_create_whole_table() {
        let cfg = CacheConfig::builder()
            .prefix("t")
            .invalidate_on_create(InvalidateOnCreate::WholeTable)
            .build();
        let (inv, store) = setup(cfg);
        let table = inv.codec().model_flush_key("widget").unwrap();

        store.set("t:q:all", b"[]".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![table], "t:q:all", Ttl::Forever).await;

        // An update leaves table-wide queries alone
        inv.handle(WriteEvent::Saved {
            entity: EntityIdentity::new("widget", 4),
            created: false,
        })
        .await
        .unwrap();
        assert!(store.get("t:q:all").await.is_hit());

        inv.handle(WriteEvent::Saved {
            entity: EntityIdentity::new("widget", 5),
            created: true,
        })
        .await
        .unwrap();
        assert_eq!(store.get("t:q:all").await, Lookup::Tombstone);
    }

    #[tokio::test]
    async fn test_invalidate_on_create_off_ignores_table_list() {
        let (inv, store) = setup(config());
        let table = inv.codec().model_flush_key("widget").unwrap();

        store.set("t:q:all", b"[]".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![table], "t:q:all", Ttl::Forever).await;

        inv.handle(WriteEvent::Saved {
            entity: EntityIdentity::new("widget", 5),
            created: true,
        })
        .await
        .unwrap();
        assert!(store.get("t:q:all").await.is_hit());
    }

    #[tokio::test]
    async fn test_invalid_identity_is_surfaced() {
        let (inv, _store) = setup(config());
        let result = inv
            .handle(WriteEvent::Deleted {
                entity: EntityIdentity::new("widget", ""),
            })
            .await;
        assert!(matches!(result, Err(CacheError::InvalidIdentity(_))));
    }

    #[tokio::test]
    async fn test_store_outage_is_swallowed() {
        let store = CacheStore::new(Arc::new(DownBackend));
        let inv = Invalidator::new(Arc::new(config()), store);

        let event = inv
            .handle(WriteEvent::Deleted {
                entity: EntityIdentity::new("widget", 1),
            })
            .await
            .unwrap();
        assert!(!event.delivered);
    }

    #[tokio::test]
    async fn test_disabled_invalidation_is_noop() {
        let cfg = CacheConfig::builder()
            .prefix("t")
            .invalidation_enabled(false)
            .build();
        let (inv, store) = setup(cfg);

        store.set("t:q:all", b"[]".to_vec(), Ttl::Forever).await;
        let event = inv.invalidate("t:o:widget:1", &[]).await;
        assert!(event.is_empty());
        assert!(store.get("t:q:all").await.is_hit());
    }

    #[tokio::test]
    async fn test_write_listener() {
        let (inv, store) = setup(config());
        let inv = Arc::new(inv);
        let widget = inv.codec().object_key("widget", "3").unwrap();

        store.set("t:q:blue", b"[]".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![widget], "t:q:blue", Ttl::Forever).await;

        let (tx, rx) = mpsc::channel(8);
        let listener = spawn_write_listener(inv.clone(), rx);

        tx.send(WriteEvent::Deleted {
            entity: EntityIdentity::new("widget", 3),
        })
        .await
        .unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(store.get("t:q:blue").await, Lookup::Tombstone);
    }

    #[tokio::test]
    async fn test_tombstone_expires_so_stale_populate_cannot_stick() {
        let cfg = CacheConfig::builder()
            .prefix("t")
            .tombstone_ttl(Duration::from_millis(50))
            .build();
        let (inv, store) = setup(cfg);
        let widget = inv.codec().object_key("widget", "1").unwrap();

        store.set("t:q:all", b"fresh".to_vec(), Ttl::Forever).await;
        inv.flush_lists().register(&vec![widget.clone()], "t:q:all", Ttl::Forever).await;
        inv.invalidate(&widget, &[]).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("t:q:all").await, Lookup::Miss);
    }
}
