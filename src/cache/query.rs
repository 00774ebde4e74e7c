//! Query cache façade
//!
//! Wraps query execution. A hit streams the cached rows without touching the
//! database. A miss streams rows straight from the executor while keeping a
//! copy; once the executor is exhausted the copy is published under the query
//! key and every returned row's flush list learns about it. A stream dropped
//! half way never writes anything.
//!
//! A row written while a miss was being read tombstones the row's record key.
//! The commit checks those keys first and publishes nothing if it finds one,
//! so a stale snapshot can never outlive the tombstone.
//!
//! [`QueryCache::execute_by_id`] splits a miss in two: the query yields row
//! identities, cached records are reused, and only the rest are loaded.

use crate::cache::{
    backend::CacheBackend,
    config::{CacheConfig, InvalidateOnCreate},
    entity::{CacheableEntity, EntityIdentity},
    flush::FlushMapping,
    invalidation::{InvalidationEvent, Invalidator},
    keys::{KeyCodec, ObjectRef, QueryFingerprint},
    manual::ManualCache,
    store::{CacheStore, Lookup},
    types::{CacheKey, CacheStats, CacheTimeout, CacheValue, Ttl},
};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Per-call options for [`QueryCache::execute`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub timeout: CacheTimeout,

    /// Overrides `CacheConfig::cache_empty_results` for this call
    pub cache_empty_results: Option<bool>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the cache for this call
    pub fn no_cache() -> Self {
        Self::new().timeout(CacheTimeout::NoCache)
    }

    pub fn timeout(mut self, timeout: CacheTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_empty_results(mut self, enable: bool) -> Self {
        self.cache_empty_results = Some(enable);
        self
    }
}

/// Cached query result wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQueryResult<R> {
    /// Normalized query the rows came from
    pub query: String,

    /// Rows in executor order
    pub rows: Vec<R>,

    /// Number of records in result
    pub record_count: usize,

    pub cached_at: DateTime<Utc>,
}

impl<R> CachedQueryResult<R> {
    pub fn new(query: String, rows: Vec<R>) -> Self {
        Self {
            query,
            record_count: rows.len(),
            rows,
            cached_at: Utc::now(),
        }
    }
}

impl<R: Serialize> CachedQueryResult<R> {
    /// Serialize to cache value
    pub fn to_cache_value(&self) -> Result<CacheValue> {
        serde_json::to_vec(self).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

impl<R: DeserializeOwned> CachedQueryResult<R> {
    /// Deserialize from cache value
    pub fn from_cache_value(value: &[u8]) -> Result<Self> {
        serde_json::from_slice(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// Row stream returned by [`QueryCache::execute`]
pub struct QueryStream<R> {
    inner: BoxStream<'static, R>,
    from_cache: bool,
}

impl<R: Send + 'static> QueryStream<R> {
    fn cached(rows: Vec<R>) -> Self {
        Self {
            inner: stream::iter(rows).boxed(),
            from_cache: true,
        }
    }

    fn live(inner: BoxStream<'static, R>) -> Self {
        Self {
            inner,
            from_cache: false,
        }
    }

    /// Whether the rows are served from the cache
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Drain the stream into a vector, which also publishes a miss
    pub async fn into_rows(self) -> Vec<R> {
        self.collect().await
    }
}

impl<R> std::fmt::Debug for QueryStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("from_cache", &self.from_cache)
            .finish_non_exhaustive()
    }
}

impl<R> Stream for QueryStream<R> {
    type Item = R;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Everything needed to publish a miss once its rows are complete
struct PendingCommit {
    cache: QueryCache,
    fingerprint: QueryFingerprint,
    key: CacheKey,
    ttl: Ttl,
    cache_empty: bool,
}

struct Populate<R> {
    source: BoxStream<'static, R>,
    rows: Vec<R>,
    commit: Option<PendingCommit>,
}

/// A serialized result and the bookkeeping that goes with it
struct PreparedCommit {
    value: CacheValue,
    mapping: FlushMapping,

    /// Record keys of every row and every row's foreign-key targets; a write
    /// to any of them tombstones its key
    guards: Vec<CacheKey>,
}

/// Stream `source` while keeping a copy, and commit the copy once the
/// source is exhausted
fn populate<R>(source: BoxStream<'static, R>, pending: PendingCommit) -> BoxStream<'static, R>
where
    R: CacheableEntity + Serialize + Clone + Send + Sync + 'static,
{
    let state = Populate {
        source,
        rows: Vec::new(),
        commit: Some(pending),
    };

    stream::unfold(state, |mut state| async move {
        match state.source.next().await {
            Some(row) => {
                state.rows.push(row.clone());
                Some((row, state))
            }
            None => {
                if let Some(pending) = state.commit.take() {
                    let rows = std::mem::take(&mut state.rows);
                    pending
                        .cache
                        .commit(
                            pending.key,
                            &pending.fingerprint,
                            rows,
                            pending.ttl,
                            pending.cache_empty,
                        )
                        .await;
                }
                None
            }
        }
    })
    .fuse()
    .boxed()
}

/// Put `rows` in the order of `refs`, dropping refs with no row
fn in_order<R: CacheableEntity>(refs: &[ObjectRef], rows: impl IntoIterator<Item = R>) -> Vec<R> {
    let mut by_ref: HashMap<ObjectRef, R> = rows
        .into_iter()
        .filter_map(|row| Some((row.identity().ok()?.object, row)))
        .collect();

    refs.iter().filter_map(|object| by_ref.remove(object)).collect()
}

/// Caches query results and registers them for invalidation
#[derive(Debug, Clone)]
pub struct QueryCache {
    config: Arc<CacheConfig>,
    codec: KeyCodec,
    store: CacheStore,
    invalidator: Arc<Invalidator>,
    stats: Arc<RwLock<CacheStats>>,
}

impl QueryCache {
    /// Create a query cache over one backend
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Result<Self> {
        Self::with_store(config, CacheStore::new(backend))
    }

    /// Create a query cache over a prepared store (e.g. with a separate list
    /// backend)
    pub fn with_store(config: CacheConfig, store: CacheStore) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing query cache (prefix {:?}, db {}, default ttl {}, invalidate on create {})",
            config.prefix, config.db_alias, config.default_ttl, config.invalidate_on_create
        );

        let config = Arc::new(config);
        let invalidator = Arc::new(Invalidator::new(config.clone(), store.clone()));

        Ok(Self {
            codec: KeyCodec::from_config(&config),
            config,
            store,
            invalidator,
            stats: Arc::new(RwLock::new(CacheStats::default())),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn invalidator(&self) -> &Arc<Invalidator> {
        &self.invalidator
    }

    /// Manual memoization sharing this cache's store and flush lists
    pub fn manual(&self) -> ManualCache {
        ManualCache::new(self.config.clone(), self.store.clone())
    }

    /// Hit and miss counters for [`execute`](Self::execute) and
    /// [`count`](Self::count)
    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Flush list tied to a query. Writing any of its rows, or invalidating
    /// it directly, drops the cached result and anything attached with
    /// [`ManualCache::cached_with`].
    pub fn query_flush_key(&self, fingerprint: &QueryFingerprint) -> CacheKey {
        self.codec.query_flush_key(fingerprint)
    }

    /// Run a query through the cache
    ///
    /// `executor` is only invoked on a miss. The returned stream must be read
    /// to the end for the result to be cached.
    pub async fn execute<R, S, F>(
        &self,
        fingerprint: &QueryFingerprint,
        executor: F,
        options: QueryOptions,
    ) -> QueryStream<R>
    where
        R: CacheableEntity + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        S: Stream<Item = R> + Send + 'static,
        F: FnOnce() -> S,
    {
        let ttl = match options.timeout.resolve(self.config.default_ttl) {
            Some(ttl) => ttl,
            None => {
                debug!("Cache bypassed for query: {}", fingerprint);
                return QueryStream::live(executor().boxed());
            }
        };

        let key = self.codec.query_key(fingerprint);
        if let Some(rows) = self.cached_rows(&key).await {
            return QueryStream::cached(rows);
        }

        let pending = self.pending(fingerprint, key, ttl, options);
        QueryStream::live(populate(executor().boxed(), pending))
    }

    /// Run a query through the cache, loading rows one record at a time
    ///
    /// On a miss `ids` lists the matching rows in result order. Rows already
    /// cached under their record keys are reused; `fetch_missed` loads the
    /// rest, in any order, and those are cached as records for the next
    /// query that returns them. Identities with no loaded row are skipped.
    /// The assembled result is then cached like [`execute`](Self::execute).
    pub async fn execute_by_id<R, S, F, M, Fut>(
        &self,
        fingerprint: &QueryFingerprint,
        ids: F,
        fetch_missed: M,
        options: QueryOptions,
    ) -> QueryStream<R>
    where
        R: CacheableEntity + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        S: Stream<Item = ObjectRef> + Send,
        F: FnOnce() -> S,
        M: FnOnce(Vec<ObjectRef>) -> Fut,
        Fut: Future<Output = Vec<R>>,
    {
        let ttl = match options.timeout.resolve(self.config.default_ttl) {
            Some(ttl) => ttl,
            None => {
                debug!("Cache bypassed for query: {}", fingerprint);
                let refs: Vec<ObjectRef> = ids().collect().await;
                let rows = fetch_missed(refs.clone()).await;
                return QueryStream::live(stream::iter(in_order(&refs, rows)).boxed());
            }
        };

        let key = self.codec.query_key(fingerprint);
        if let Some(rows) = self.cached_rows(&key).await {
            return QueryStream::cached(rows);
        }

        let pending = self.pending(fingerprint, key, ttl, options);
        let refs: Vec<ObjectRef> = ids().collect().await;
        let rows = self.load_records(&refs, fetch_missed, pending.ttl).await;

        QueryStream::live(populate(stream::iter(rows).boxed(), pending))
    }

    /// Cached rows under `key`, counting the hit or miss
    async fn cached_rows<R: DeserializeOwned>(&self, key: &str) -> Option<Vec<R>> {
        match self.store.get(key).await {
            Lookup::Hit(raw) => match CachedQueryResult::<R>::from_cache_value(&raw) {
                Ok(cached) => {
                    self.stats.write().await.hits += 1;
                    debug!("Cache hit: {} ({} rows)", key, cached.record_count);
                    return Some(cached.rows);
                }
                Err(e) => {
                    // Clear it so the re-executed result can take its place
                    warn!("Cache entry {} unreadable, re-executing: {}", key, e);
                    self.store.delete(key).await;
                }
            },
            Lookup::Tombstone => debug!("Cache entry {} recently invalidated", key),
            Lookup::Miss => debug!("Cache miss: {}", key),
        }
        self.stats.write().await.misses += 1;
        None
    }

    fn pending(
        &self,
        fingerprint: &QueryFingerprint,
        key: CacheKey,
        ttl: Ttl,
        options: QueryOptions,
    ) -> PendingCommit {
        PendingCommit {
            cache: self.clone(),
            fingerprint: fingerprint.clone(),
            key,
            ttl: self.config.ttl_with_jitter(ttl),
            cache_empty: options
                .cache_empty_results
                .unwrap_or(self.config.cache_empty_results),
        }
    }

    /// Resolve `refs` against the record cache, loading and caching misses
    async fn load_records<R, M, Fut>(&self, refs: &[ObjectRef], fetch_missed: M, ttl: Ttl) -> Vec<R>
    where
        R: CacheableEntity + Serialize + DeserializeOwned,
        M: FnOnce(Vec<ObjectRef>) -> Fut,
        Fut: Future<Output = Vec<R>>,
    {
        let lookups = join_all(refs.iter().map(|object| async move {
            match self.codec.record_key(&object.table, &object.pk) {
                Ok(key) => self.store.get_decoded::<R>(&key).await,
                Err(e) => {
                    warn!("Record {} not cacheable: {}", object, e);
                    None
                }
            }
        }))
        .await;

        let mut rows = Vec::with_capacity(refs.len());
        let mut missed = Vec::new();
        let mut seen = HashSet::new();
        for (object, cached) in refs.iter().zip(lookups) {
            match cached {
                Some(row) => rows.push(row),
                None if seen.insert(object) => missed.push(object.clone()),
                None => {}
            }
        }

        if !missed.is_empty() {
            debug!("{} of {} records missed, fetching", missed.len(), refs.len());
            let fetched = fetch_missed(missed).await;
            join_all(fetched.iter().map(|row| self.store_record(row, ttl))).await;
            rows.extend(fetched);
        }

        in_order(refs, rows)
    }

    /// Cache one row under its record key unless a recent write tombstoned
    /// it, and hook the record into its flush lists
    async fn store_record<R>(&self, row: &R, ttl: Ttl)
    where
        R: CacheableEntity + Serialize,
    {
        let prepared = row.identity().and_then(|identity| {
            let key = self
                .codec
                .record_key(&identity.object.table, &identity.object.pk)?;
            let mapping = self.record_mapping(&identity, &key)?;
            Ok((key, mapping, serde_json::to_vec(row)?))
        });

        match prepared {
            Ok((key, mapping, value)) => {
                let flush = self.invalidator.flush_lists();
                tokio::join!(
                    self.store.add(&key, value, ttl),
                    flush.add_to_flush_lists(&mapping, ttl)
                );
            }
            Err(e) => warn!("Record not cached: {}", e),
        }
    }

    /// A record hangs off its own flush list; its flush list hangs off those
    /// of its foreign-key targets
    fn record_mapping(&self, identity: &EntityIdentity, record_key: &str) -> Result<FlushMapping> {
        let object_key = self.codec.object_ref_key(&identity.object)?;
        let mut mapping = FlushMapping::new();

        for reference in &identity.references {
            let target = self.codec.object_ref_key(reference)?;
            if target != object_key {
                mapping.entry(target).or_default().insert(object_key.clone());
            }
        }
        mapping
            .entry(object_key)
            .or_default()
            .insert(record_key.to_string());

        Ok(mapping)
    }

    /// Publish a fully read result and register its flush lists
    async fn commit<R>(
        &self,
        key: CacheKey,
        fingerprint: &QueryFingerprint,
        rows: Vec<R>,
        ttl: Ttl,
        cache_empty: bool,
    ) where
        R: CacheableEntity + Serialize,
    {
        if rows.is_empty() && !cache_empty {
            debug!("Not caching empty result: {}", key);
            return;
        }

        let prepared = match self.prepare_commit(&key, fingerprint, rows) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Result for {} not cached: {}", key, e);
                return;
            }
        };

        // The result's flush lists did not exist while it was being read, so
        // a write in that window only left tombstones on the record keys
        if self.written_during_read(&prepared.guards).await {
            debug!("Not caching {}: a row changed while it was read", key);
            return;
        }

        // `add`, not `set`: a tombstone left by a concurrent invalidation must
        // win over rows read before that write committed
        let flush = self.invalidator.flush_lists();
        let (stored, ()) = tokio::join!(
            self.store.add(&key, prepared.value, ttl),
            flush.add_to_flush_lists(&prepared.mapping, ttl)
        );

        if stored {
            debug!("Cached {} (ttl {}, {} flush lists)", key, ttl, prepared.mapping.len());
        } else {
            debug!("Not caching {}: key already populated or invalidated", key);
        }
    }

    async fn written_during_read(&self, guards: &[CacheKey]) -> bool {
        if !self.config.invalidation_enabled {
            return false;
        }
        join_all(guards.iter().map(|key| self.store.get(key)))
            .await
            .into_iter()
            .any(|lookup| lookup == Lookup::Tombstone)
    }

    /// Serialize the rows and compute their flush-list membership. Fails when
    /// a row has no usable identity, since such a result could never be
    /// invalidated.
    fn prepare_commit<R>(
        &self,
        key: &str,
        fingerprint: &QueryFingerprint,
        rows: Vec<R>,
    ) -> Result<PreparedCommit>
    where
        R: CacheableEntity + Serialize,
    {
        let query_flush = self.codec.query_flush_key(fingerprint);
        let mut guards = HashSet::new();
        let mut mapping = FlushMapping::new();
        let mut add = |list: CacheKey, member: CacheKey| {
            mapping.entry(list).or_default().insert(member);
        };

        add(query_flush.clone(), key.to_string());

        for row in &rows {
            let identity = row.identity()?;
            let object_key = self.codec.object_ref_key(&identity.object)?;
            guards.insert(
                self.codec
                    .record_key(&identity.object.table, &identity.object.pk)?,
            );

            if self.config.invalidate_on_create == InvalidateOnCreate::WholeTable {
                add(self.codec.model_flush_key(&identity.object.table)?, key.to_string());
            }

            for reference in &identity.references {
                guards.insert(self.codec.record_key(&reference.table, &reference.pk)?);
                let target = self.codec.object_ref_key(reference)?;
                if target != object_key {
                    add(target, object_key.clone());
                }
            }

            // The query flush list carries values attached to this result
            add(object_key.clone(), query_flush.clone());
            add(object_key, key.to_string());
        }

        let value = CachedQueryResult::new(fingerprint.normalized(), rows).to_cache_value()?;
        Ok(PreparedCommit {
            value,
            mapping,
            guards: guards.into_iter().collect(),
        })
    }

    /// Cache a row count under `count_timeout`
    ///
    /// Counts are not registered in any flush list and go stale until they
    /// expire.
    pub async fn count<F, Fut>(&self, fingerprint: &QueryFingerprint, options: QueryOptions, compute: F) -> u64
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = u64>,
    {
        let ttl = match self.config.count_ttl() {
            Some(ttl) if !options.timeout.is_no_cache() => ttl,
            _ => return compute().await,
        };

        let key = self.codec.count_key(fingerprint);
        if let Some(count) = self.store.get_decoded::<u64>(&key).await {
            self.stats.write().await.hits += 1;
            debug!("Count cache hit: {}", key);
            return count;
        }
        self.stats.write().await.misses += 1;

        let count = compute().await;
        self.store.set_encoded(&key, &count, ttl).await;
        count
    }

    /// Cache a single row under its record key, where
    /// [`execute_by_id`](Self::execute_by_id) will find it. Overwrites any
    /// cached copy; dropped when the row or a foreign-key target is
    /// invalidated.
    pub async fn put_record<R>(&self, row: &R) -> Result<()>
    where
        R: CacheableEntity + Serialize,
    {
        let identity = row.identity()?;
        let key = self
            .codec
            .record_key(&identity.object.table, &identity.object.pk)?;
        let mapping = self.record_mapping(&identity, &key)?;
        let value = serde_json::to_vec(row)?;
        let ttl = self.config.ttl_with_jitter(self.config.default_ttl);

        let flush = self.invalidator.flush_lists();
        tokio::join!(
            self.store.set(&key, value, ttl),
            flush.add_to_flush_lists(&mapping, ttl)
        );
        Ok(())
    }

    /// Fetch a row cached with [`put_record`](Self::put_record) or loaded by
    /// [`execute_by_id`](Self::execute_by_id)
    pub async fn get_record<R>(&self, table: &str, pk: &str) -> Result<Option<R>>
    where
        R: DeserializeOwned,
    {
        let key = self.codec.record_key(table, pk)?;
        Ok(self.store.get_decoded(&key).await)
    }

    /// Invalidate an object and related objects by flush key
    pub async fn invalidate(&self, object_key: &str, related: &[CacheKey]) -> InvalidationEvent {
        self.invalidator.invalidate(object_key, related).await
    }

    /// Invalidate rows by value
    pub async fn invalidate_objects<R: CacheableEntity>(&self, rows: &[R]) -> Result<InvalidationEvent> {
        self.invalidator.invalidate_objects(rows).await
    }
}
