//! In-process backend with TTL expiry and LRU eviction
//!
//! Useful for tests and single-process deployments. Values and lists live in
//! one `RwLock`-guarded store, so every operation (including `take_list`) is
//! atomic.
//!
//! Flush lists are ordinary residents: they expire, they count against
//! `max_entries` and they take part in LRU eviction. Evicting a list also
//! drops the values it points at when they live in this backend, so a value
//! never outlives the only list that could invalidate it.

use crate::cache::{
    backend::CacheBackend,
    entry::{CacheEntry, ListEntry},
    types::{CacheKey, CacheStats, CacheValue, Ttl},
};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Memory limits for [`MemoryBackend`]
#[derive(Debug, Clone)]
pub struct MemoryLimits {
    /// Maximum number of values and lists together
    pub max_entries: usize,

    /// Maximum total size of values in bytes
    pub max_size_bytes: usize,

    /// Maximum members in one list; a full list is evicted and restarted
    pub max_list_members: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            // 100 MB
            max_size_bytes: 100 * 1024 * 1024,
            max_list_members: 10_000,
        }
    }
}

/// In-memory cache backend
#[derive(Debug)]
pub struct MemoryBackend {
    limits: MemoryLimits,
    store: RwLock<MemoryStore>,
}

/// LRU queue slot; values and lists live in separate maps
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Value(CacheKey),
    List(CacheKey),
}

#[derive(Debug, Default)]
struct MemoryStore {
    /// Main storage: key -> entry
    entries: HashMap<CacheKey, CacheEntry>,

    /// Flush lists
    lists: HashMap<CacheKey, ListEntry>,

    /// LRU tracking over values and lists: maintains access order
    lru_queue: VecDeque<Slot>,

    stats: CacheStats,

    /// Total size of cached data in bytes
    current_size_bytes: usize,
}

impl MemoryStore {
    fn resident(&self) -> usize {
        self.entries.len() + self.lists.len()
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru_queue
            .retain(|slot| !matches!(slot, Slot::Value(k) if k == key));
        self.current_size_bytes = self
            .current_size_bytes
            .saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn remove_list(&mut self, key: &str) -> Option<ListEntry> {
        let list = self.lists.remove(key)?;
        self.lru_queue
            .retain(|slot| !matches!(slot, Slot::List(k) if k == key));
        Some(list)
    }

    fn touch(&mut self, slot: Slot) {
        self.lru_queue.retain(|s| *s != slot);
        self.lru_queue.push_back(slot);
    }

    /// Drop a list together with the values it points at
    fn evict_list(&mut self, key: &str) {
        if let Some(list) = self.remove_list(key) {
            let dropped = list
                .members
                .iter()
                .filter(|member| self.remove_entry(member).is_some())
                .count();
            debug!("Evicted list {} and {} dependent values", key, dropped);
        }
    }

    /// Evict the least recently used resident. Returns false when empty.
    fn evict_lru(&mut self) -> bool {
        match self.lru_queue.pop_front() {
            Some(Slot::Value(key)) => {
                debug!("Evicting entry: {}", key);
                self.remove_entry(&key);
            }
            Some(Slot::List(key)) => self.evict_list(&key),
            None => return false,
        }
        self.stats.evictions_size += 1;
        true
    }

    fn refresh_stats(&mut self) {
        self.stats.entries = self.entries.len();
        self.stats.lists = self.lists.len();
        self.stats.size_bytes = self.current_size_bytes;
    }
}

impl MemoryBackend {
    /// Create a backend with default limits
    pub fn new() -> Self {
        Self::with_limits(MemoryLimits::default())
    }

    /// Create a backend with the given limits
    pub fn with_limits(limits: MemoryLimits) -> Self {
        info!("Initializing memory cache backend with limits: {:?}", limits);

        Self {
            limits,
            store: RwLock::new(MemoryStore::default()),
        }
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let mut store = self.store.write().await;
        store.refresh_stats();
        store.stats.clone()
    }

    /// Number of live values
    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    /// Whether no values are stored
    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }

    /// Number of flush lists held
    pub async fn list_count(&self) -> usize {
        self.store.read().await.lists.len()
    }

    /// Drop every value and list
    pub async fn clear(&self) {
        let mut store = self.store.write().await;
        let count = store.resident();
        store.entries.clear();
        store.lru_queue.clear();
        store.lists.clear();
        store.current_size_bytes = 0;
        store.stats.invalidations += count as u64;
        store.refresh_stats();

        info!("Cleared {} entries from memory backend", count);
    }

    /// Remove all expired values and lists, returning the removed keys
    pub async fn cleanup_expired(&self) -> Vec<CacheKey> {
        let mut store = self.store.write().await;

        let expired_values: Vec<CacheKey> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        let expired_lists: Vec<CacheKey> = store
            .lists
            .iter()
            .filter(|(_, list)| list.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_values {
            store.remove_entry(key);
        }
        for key in &expired_lists {
            store.remove_list(key);
        }

        let mut expired = expired_values;
        expired.extend(expired_lists);
        if !expired.is_empty() {
            store.stats.evictions_ttl += expired.len() as u64;
            store.refresh_stats();
            debug!("Cleaned up {} expired entries", expired.len());
        }

        expired
    }

    /// Evict least recently used residents until one more fits, plus
    /// `needed_size` bytes of value
    fn evict_if_needed(&self, store: &mut MemoryStore, needed_size: usize) -> Result<()> {
        while store.resident() >= self.limits.max_entries {
            if !store.evict_lru() {
                break;
            }
        }

        while store.current_size_bytes + needed_size > self.limits.max_size_bytes {
            if !store.evict_lru() {
                warn!("Cannot evict more entries, cache size limit exceeded");
                return Err(CacheError::StoreUnavailable(
                    "memory backend size limit exceeded".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Replace `entry.key` under an already held lock
    fn insert(&self, store: &mut MemoryStore, entry: CacheEntry) -> Result<()> {
        let key = entry.key.clone();
        let size = entry.size_bytes;

        store.remove_entry(&key);
        self.evict_if_needed(store, size)?;

        store.entries.insert(key.clone(), entry);
        store.lru_queue.push_back(Slot::Value(key));
        store.current_size_bytes += size;
        store.refresh_stats();

        Ok(())
    }

    /// Live list under `key`, dropping it first if expired
    fn live_list<'a>(&self, store: &'a mut MemoryStore, key: &str) -> Option<&'a mut ListEntry> {
        if store.lists.get(key).is_some_and(ListEntry::is_expired) {
            debug!("Flush list expired: {}", key);
            store.remove_list(key);
            store.stats.evictions_ttl += 1;
        }
        store.lists.get_mut(key)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let mut store = self.store.write().await;

        match store.entries.get(key).map(CacheEntry::is_expired) {
            None => {
                store.stats.misses += 1;
                return Ok(None);
            }
            Some(true) => {
                debug!("Cache entry expired: {}", key);
                store.remove_entry(key);
                store.stats.misses += 1;
                store.stats.evictions_ttl += 1;
                return Ok(None);
            }
            Some(false) => {}
        }

        let value = match store.entries.get_mut(key) {
            Some(entry) => {
                entry.record_read();
                entry.value.clone()
            }
            None => return Ok(None),
        };
        store.touch(Slot::Value(key.to_string()));
        store.stats.hits += 1;

        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Ttl) -> Result<()> {
        let entry = CacheEntry::new(key.to_string(), value, ttl);
        let mut store = self.store.write().await;
        self.insert(&mut store, entry)
    }

    async fn add(&self, key: &str, value: CacheValue, ttl: Ttl) -> Result<bool> {
        let mut store = self.store.write().await;
        let live = store
            .entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false);
        if live {
            return Ok(false);
        }

        self.insert(&mut store, CacheEntry::new(key.to_string(), value, ttl))?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut store = self.store.write().await;
        if store.remove_entry(key).is_some() {
            store.stats.invalidations += 1;
            store.refresh_stats();
        }
        Ok(())
    }

    async fn add_to_list(&self, list_key: &str, value: &str, ttl: Ttl) -> Result<()> {
        let mut store = self.store.write().await;
        let max_members = self.limits.max_list_members;

        let full = match self.live_list(&mut store, list_key) {
            Some(list) => !list.members.contains(value) && list.members.len() >= max_members,
            None => false,
        };
        if full {
            debug!("Flush list {} reached {} members, restarting it", list_key, max_members);
            store.evict_list(list_key);
            store.stats.evictions_size += 1;
        }

        if !store.lists.contains_key(list_key) {
            self.evict_if_needed(&mut store, 0)?;
            store
                .lists
                .insert(list_key.to_string(), ListEntry::new(ttl));
        }

        if let Some(list) = store.lists.get_mut(list_key) {
            list.extend(ttl);
            list.members.insert(value.to_string());
        }
        store.touch(Slot::List(list_key.to_string()));
        store.refresh_stats();
        Ok(())
    }

    async fn get_list(&self, list_key: &str) -> Result<Vec<String>> {
        let mut store = self.store.write().await;
        Ok(self
            .live_list(&mut store, list_key)
            .map(|list| list.members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_list(&self, list_key: &str) -> Result<()> {
        let mut store = self.store.write().await;
        if store.remove_list(list_key).is_some() {
            store.stats.invalidations += 1;
            store.refresh_stats();
        }
        Ok(())
    }

    async fn take_list(&self, list_key: &str) -> Result<Vec<String>> {
        let mut store = self.store.write().await;
        if self.live_list(&mut store, list_key).is_none() {
            return Ok(Vec::new());
        }

        let members = store.remove_list(list_key);
        if members.is_some() {
            store.stats.invalidations += 1;
            store.refresh_stats();
        }
        Ok(members
            .map(|list| list.members.into_iter().collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Background task for periodic removal of expired values and lists
pub async fn start_auto_cleanup(backend: Arc<MemoryBackend>, interval: Duration) {
    info!("Starting automatic cache cleanup task (interval: {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;

        let removed = backend.cleanup_expired().await;
        if !removed.is_empty() {
            debug!("Auto cleanup removed {} entries", removed.len());
        }
    }
}
