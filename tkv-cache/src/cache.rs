//! # Cache Coordinator
//!
//! Route every operation across the two tiers while keeping them consistent:
//! reads consult memory then disk (promoting disk hits), writes land on disk
//! first and mirror into memory, and disk-side evictions propagate back into
//! memory through the eviction upcall.
//!
//! ## Design Principles
//!
//! 1. **Disk Is Truth**: Memory is never written before the disk write
//!    succeeds, so every key in memory also exists on disk with the same
//!    expiry.
//! 2. **Facade Over Inner**: The public handle is a thin typed wrapper around
//!    a byte-level `Inner` shared behind an `Arc`; serialization happens once
//!    at the boundary and the encoded bytes flow through both tiers.
//! 3. **Single-Flight Cache-Aside**: Concurrent `get_or_set` calls for one
//!    key share a single computation; waiters receive the leader's result or
//!    its error.
//! 4. **Short Locks**: Tier locks are released before every suspension point.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use tkv_common::codec::Compression;
use tkv_common::hash::{KeyHasher, Md5Hasher};
use tkv_common::pattern::Matcher;
use tkv_common::types::{now_ms, Envelope, TtlStatus};
use tkv_common::{TkvError, TkvResult};
use tkv_engine::file::{EvictionCallback, FileStore, FileStoreConfig};
use tkv_engine::memory::{MemoryStats, MemoryStore};

use crate::config::CacheConfig;
use crate::tasks;

/// Result carried by a shared in-flight computation.
type FlightResult = Result<Bytes, Arc<TkvError>>;

/// Snapshot of cache counters across both tiers.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Reads answered by either tier.
    pub hits: u64,
    /// Reads answered by neither tier.
    pub misses: u64,
    /// `hits / (hits + misses)`, or zero before any read.
    pub hit_rate: f64,
    /// Memory tier counters.
    pub memory: MemoryStats,
    /// Indexed bytes on disk.
    pub disk_size: u64,
    /// Entries on disk.
    pub disk_items: usize,
}

/// Resolves a caller TTL against the configured default.
///
/// `None` falls back to the default; `Duration::ZERO` (from either source)
/// explicitly means "no expiry". Positive durations become an absolute
/// millisecond deadline.
fn resolve_expiry(ttl: Option<Duration>, default_ttl: Option<Duration>) -> Option<u64> {
    let effective = match ttl {
        Some(ttl) => ttl,
        None => default_ttl?,
    };
    if effective.is_zero() {
        return None;
    }
    Some(now_ms() + effective.as_millis() as u64)
}

/// Byte-level coordinator state shared by all handles of one cache.
pub(crate) struct Inner {
    pub(crate) config: CacheConfig,
    pub(crate) memory: Arc<Mutex<MemoryStore>>,
    pub(crate) file: FileStore,
    pub(crate) touch_timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    pub(crate) closed: AtomicBool,
    prune_task: Mutex<Option<JoinHandle<()>>>,
}

/// Role a `get_or_set` caller plays for its key.
enum Flight {
    Leader(broadcast::Sender<FlightResult>),
    Waiter(broadcast::Receiver<FlightResult>),
}

impl Inner {
    fn ensure_open(&self) -> TkvResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TkvError::Closed);
        }
        Ok(())
    }

    /// Applies the namespace prefix.
    fn scoped(&self, key: &str) -> String {
        match &self.config.namespace {
            Some(ns) => format!("{ns}:{key}"),
            None => key.to_string(),
        }
    }

    fn resolve_expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        resolve_expiry(ttl, self.config.default_ttl)
    }

    /// Memory-then-disk read with promotion, counters, and touch scheduling.
    async fn lookup(self: &Arc<Self>, scoped: &str) -> TkvResult<Option<Bytes>> {
        let from_memory = self.memory.lock().get(scoped);
        if let Some(bytes) = from_memory {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tasks::schedule_touch(self, scoped.to_string());
            return Ok(Some(bytes));
        }

        match self.file.get(scoped).await? {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if entry.value.len() as u64 <= self.config.max_memory_size {
                    self.memory
                        .lock()
                        .set(scoped, entry.value.clone(), entry.expires_at);
                }
                Ok(Some(entry.value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn get_raw(self: &Arc<Self>, key: &str) -> TkvResult<Option<Bytes>> {
        self.ensure_open()?;
        let scoped = self.scoped(key);
        self.lookup(&scoped).await
    }

    /// Read without LRU promotion, access-time updates, or counters.
    async fn peek_raw(&self, key: &str) -> TkvResult<Option<Bytes>> {
        self.ensure_open()?;
        let scoped = self.scoped(key);
        let from_memory = self.memory.lock().peek(&scoped);
        if let Some(bytes) = from_memory {
            return Ok(Some(bytes));
        }
        Ok(self.file.peek(&scoped).await?.map(|entry| entry.value))
    }

    /// Disk-first write. Memory is only updated after the disk write lands,
    /// and only when the value fits the memory bound. Returns the serialized
    /// value bytes for reuse by callers.
    async fn set_scoped(
        &self,
        scoped: &str,
        value_json: String,
        expires_at: Option<u64>,
    ) -> TkvResult<Bytes> {
        let envelope = Envelope::from_parts(scoped, value_json, expires_at)?;
        let value_bytes = Bytes::copy_from_slice(envelope.value_json().as_bytes());
        let encoded = envelope.to_bytes()?;
        self.file.set(scoped, &encoded, expires_at).await?;
        if value_bytes.len() as u64 <= self.config.max_memory_size {
            self.memory
                .lock()
                .set(scoped, value_bytes.clone(), expires_at);
        }
        Ok(value_bytes)
    }

    async fn del_raw(&self, key: &str) -> TkvResult<bool> {
        self.ensure_open()?;
        let scoped = self.scoped(key);
        self.cancel_touch(&scoped);
        let in_memory = self.memory.lock().delete(&scoped);
        let on_disk = self.file.delete(&scoped).await?;
        Ok(in_memory || on_disk)
    }

    async fn exists_raw(&self, key: &str) -> TkvResult<bool> {
        self.ensure_open()?;
        let scoped = self.scoped(key);
        let in_memory = self.memory.lock().has(&scoped);
        if in_memory {
            return Ok(true);
        }
        self.file.has(&scoped).await
    }

    async fn keys_raw(&self, pattern: &str) -> TkvResult<Vec<String>> {
        self.ensure_open()?;
        let matcher = Matcher::compile(&self.scoped(pattern))?;
        let mut keys = self.file.keys(&matcher).await?;
        let from_memory = self.memory.lock().keys(&matcher);

        let mut seen: HashSet<String> = keys.iter().cloned().collect();
        for key in from_memory {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        let prefix = self.config.namespace.as_ref().map(|ns| format!("{ns}:"));
        Ok(keys
            .into_iter()
            .map(|key| match &prefix {
                Some(prefix) => key
                    .strip_prefix(prefix.as_str())
                    .map(str::to_string)
                    .unwrap_or(key),
                None => key,
            })
            .collect())
    }

    /// Disk first: it is the source of truth; memory mirrors best-effort.
    async fn apply_expiry(&self, key: &str, expires_at: Option<u64>) -> TkvResult<bool> {
        self.ensure_open()?;
        let scoped = self.scoped(key);
        let updated = self.file.set_expiry(&scoped, expires_at).await?;
        if updated {
            self.memory.lock().set_expiry(&scoped, expires_at);
        }
        Ok(updated)
    }

    async fn touch_raw(&self, key: &str) -> TkvResult<bool> {
        self.ensure_open()?;
        let scoped = self.scoped(key);
        let touched = self.file.touch(&scoped).await?;
        if touched {
            self.memory.lock().touch(&scoped);
        }
        Ok(touched)
    }

    async fn ttl_raw(&self, key: &str) -> TkvResult<TtlStatus> {
        self.ensure_open()?;
        let scoped = self.scoped(key);
        let from_memory = self.memory.lock().get_ttl(&scoped);
        match from_memory {
            TtlStatus::Missing => self.file.get_ttl(&scoped).await,
            status => Ok(status),
        }
    }

    async fn prune_raw(&self) -> TkvResult<usize> {
        self.ensure_open()?;
        self.memory.lock().prune();
        self.file.prune().await
    }

    async fn clear_raw(&self) -> TkvResult<()> {
        self.ensure_open()?;
        self.cancel_all_touches();
        self.memory.lock().clear();
        self.file.clear().await
    }

    async fn stats_raw(&self) -> TkvResult<CacheStats> {
        self.ensure_open()?;
        let disk_size = self.file.size().await?;
        let disk_items = self.file.item_count().await?;
        let memory = self.memory.lock().stats();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        Ok(CacheStats {
            hits,
            misses,
            hit_rate,
            memory,
            disk_size,
            disk_items,
        })
    }

    fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Shared-computation `get_or_set` core.
    ///
    /// The first caller for a key leads: it re-checks the cache, runs the
    /// loader, writes the result, and broadcasts serialized bytes (or the
    /// error) to every waiter that subscribed in the meantime. The flight
    /// entry is removed when the computation settles, so a failed load is
    /// retried by the next caller.
    async fn get_or_set_raw<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        loader: F,
        ttl: Option<Duration>,
    ) -> TkvResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TkvResult<String>>,
    {
        if let Some(bytes) = self.get_raw(key).await? {
            return Ok(bytes);
        }

        let scoped = self.scoped(key);
        let mut loader = Some(loader);
        loop {
            let flight = {
                let mut flights = self.in_flight.lock();
                match flights.get(&scoped) {
                    Some(tx) => Flight::Waiter(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        flights.insert(scoped.clone(), tx.clone());
                        Flight::Leader(tx)
                    }
                }
            };

            match flight {
                Flight::Waiter(mut rx) => match rx.recv().await {
                    Ok(Ok(bytes)) => return Ok(bytes),
                    Ok(Err(shared)) => return Err(TkvError::Shared(shared)),
                    // The leader went away without settling; race for the
                    // slot again.
                    Err(_) => continue,
                },
                Flight::Leader(tx) => {
                    let loader = loader.take().expect("flight led at most once");
                    let outcome = self.lead(&scoped, loader, ttl).await;
                    let (broadcastable, result) = match outcome {
                        Ok(bytes) => (Ok(bytes.clone()), Ok(bytes)),
                        Err(err) => {
                            let shared = Arc::new(err);
                            (Err(Arc::clone(&shared)), Err(TkvError::Shared(shared)))
                        }
                    };
                    {
                        let mut flights = self.in_flight.lock();
                        // Send before removing so every subscribed waiter
                        // observes the settled result.
                        let _ = tx.send(broadcastable);
                        flights.remove(&scoped);
                    }
                    return result;
                }
            }
        }
    }

    async fn lead<F, Fut>(
        self: &Arc<Self>,
        scoped: &str,
        loader: F,
        ttl: Option<Duration>,
    ) -> TkvResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TkvResult<String>>,
    {
        // A writer may have landed the key between the miss and the flight.
        if let Some(bytes) = self.lookup(scoped).await? {
            return Ok(bytes);
        }
        let value_json = loader().await?;
        let expires_at = self.resolve_expiry(ttl);
        self.set_scoped(scoped, value_json, expires_at).await
    }

    fn cancel_touch(&self, scoped: &str) {
        if let Some(handle) = self.touch_timers.lock().remove(scoped) {
            handle.abort();
        }
    }

    fn cancel_all_touches(&self) {
        for (_, handle) in self.touch_timers.lock().drain() {
            handle.abort();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.prune_task.lock().take() {
            handle.abort();
        }
        self.cancel_all_touches();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.prune_task.lock().take() {
            handle.abort();
        }
        for (_, handle) in self.touch_timers.lock().drain() {
            handle.abort();
        }
    }
}

/// Two-tier cache handle, generic over the cached value type.
///
/// Values are serialized as JSON at the boundary; both tiers hold bytes. The
/// handle is cheap to clone and shares one cache.
///
/// A stored JSON `null` is indistinguishable from a missing key on read; use
/// a sentinel value for negative caching.
pub struct TieredCache<T> {
    inner: Arc<Inner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TieredCache<T> {
    fn clone(&self) -> Self {
        TieredCache {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(error = %err, "stored value does not decode; treating as missing");
            None
        }
    }
}

impl<T> TieredCache<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a cache with the default MD5 key digest.
    ///
    /// No I/O happens here; the disk tier initializes lazily on the first
    /// operation. When `prune_interval` is configured, this must be called
    /// within a Tokio runtime so the prune task can be spawned.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_hasher(config, Arc::new(Md5Hasher))
    }

    /// Creates a cache with a caller-provided key digest.
    pub fn with_hasher(config: CacheConfig, hasher: Arc<dyn KeyHasher>) -> Self {
        let memory = Arc::new(Mutex::new(MemoryStore::new(
            config.max_memory_items,
            config.max_memory_size,
        )));
        let touch_timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Disk dropped an entry: mirror the removal so memory stays a subset
        // of disk, and stop any pending touch for the key.
        let mirror = Arc::clone(&memory);
        let timers = Arc::clone(&touch_timers);
        let on_evict: EvictionCallback = Box::new(move |key: &str| {
            mirror.lock().delete(key);
            if let Some(handle) = timers.lock().remove(key) {
                handle.abort();
            }
        });

        let file = FileStore::with_hasher(
            FileStoreConfig {
                dir: config.dir.clone(),
                shards: config.shards,
                max_size: config.max_disk_size,
                compression: if config.gzip {
                    Compression::Gzip
                } else {
                    Compression::None
                },
            },
            hasher,
            on_evict,
        );

        let inner = Arc::new(Inner {
            memory,
            file,
            touch_timers,
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            prune_task: Mutex::new(None),
            config,
        });

        if let Some(every) = inner.config.prune_interval {
            let handle = tasks::spawn_pruner(&inner, every);
            *inner.prune_task.lock() = Some(handle);
        }

        TieredCache {
            inner,
            _marker: PhantomData,
        }
    }

    /// Reads a key: memory first, then disk with promotion into memory.
    ///
    /// Returns `None` for missing, expired, or undecodable entries.
    pub async fn get(&self, key: &str) -> TkvResult<Option<T>> {
        match self.inner.get_raw(key).await? {
            Some(bytes) => Ok(decode_value(&bytes)),
            None => Ok(None),
        }
    }

    /// Reads a key without promoting it in either tier.
    pub async fn peek(&self, key: &str) -> TkvResult<Option<T>> {
        match self.inner.peek_raw(key).await? {
            Some(bytes) => Ok(decode_value(&bytes)),
            None => Ok(None),
        }
    }

    /// Writes a key to disk and, when it fits, to memory.
    ///
    /// `ttl` of `None` uses the configured default; `Duration::ZERO` opts out
    /// of expiry explicitly. Fails with an invalid-value error when the value
    /// cannot be serialized, and with an I/O error when the disk write fails;
    /// memory is untouched in both cases.
    pub async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> TkvResult<()> {
        self.inner.ensure_open()?;
        let value_json = serde_json::to_string(value)?;
        let scoped = self.inner.scoped(key);
        let expires_at = self.inner.resolve_expiry(ttl);
        self.inner
            .set_scoped(&scoped, value_json, expires_at)
            .await?;
        Ok(())
    }

    /// Removes a key from both tiers; returns whether either had it.
    pub async fn del(&self, key: &str) -> TkvResult<bool> {
        self.inner.del_raw(key).await
    }

    /// Returns whether a live entry exists in either tier.
    pub async fn exists(&self, key: &str) -> TkvResult<bool> {
        self.inner.exists_raw(key).await
    }

    /// Lists live keys matching a glob pattern, with the namespace prefix
    /// stripped from the results.
    pub async fn keys(&self, pattern: &str) -> TkvResult<Vec<String>> {
        self.inner.keys_raw(pattern).await
    }

    /// Sets a TTL on an existing key; returns whether the key was live.
    pub async fn expire(&self, key: &str, ttl: Duration) -> TkvResult<bool> {
        let expires_at = Some(now_ms() + ttl.as_millis() as u64);
        self.inner.apply_expiry(key, expires_at).await
    }

    /// Removes any TTL from an existing key; returns whether it was live.
    pub async fn persist(&self, key: &str) -> TkvResult<bool> {
        self.inner.apply_expiry(key, None).await
    }

    /// Marks a key recently used in both tiers without reading its value.
    pub async fn touch(&self, key: &str) -> TkvResult<bool> {
        self.inner.touch_raw(key).await
    }

    /// Reports TTL state for a key. Memory is authoritative when it holds
    /// the key; disk answers otherwise.
    pub async fn ttl(&self, key: &str) -> TkvResult<TtlStatus> {
        self.inner.ttl_raw(key).await
    }

    /// Concurrent `get` over a list of keys, preserving order.
    pub async fn mget(&self, keys: &[&str]) -> TkvResult<Vec<Option<T>>> {
        self.inner.ensure_open()?;
        join_all(keys.iter().map(|key| self.get(key)))
            .await
            .into_iter()
            .collect()
    }

    /// Batch write. Every entry is serialized before any tier is touched, so
    /// a non-serializable value fails the whole batch with no partial writes;
    /// the prepared disk writes then run concurrently.
    pub async fn mset(&self, entries: &[(&str, T, Option<Duration>)]) -> TkvResult<()> {
        self.inner.ensure_open()?;
        let mut prepared = Vec::with_capacity(entries.len());
        for (key, value, ttl) in entries {
            let value_json = serde_json::to_string(value)?;
            let scoped = self.inner.scoped(key);
            let expires_at = self.inner.resolve_expiry(*ttl);
            prepared.push((scoped, value_json, expires_at));
        }

        let writes = prepared.into_iter().map(|(scoped, value_json, expires_at)| {
            let inner = &self.inner;
            async move {
                inner.set_scoped(&scoped, value_json, expires_at).await?;
                Ok::<(), TkvError>(())
            }
        });
        for result in join_all(writes).await {
            result?;
        }
        Ok(())
    }

    /// Cache-aside read with stampede protection.
    ///
    /// On a miss, concurrent callers for the same key share one invocation of
    /// `f`; all of them receive its value, or its error if it fails. Nothing
    /// is cached on failure, so the next call runs `f` again.
    pub async fn get_or_set<F, Fut>(&self, key: &str, f: F, ttl: Option<Duration>) -> TkvResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TkvResult<T>>,
    {
        let bytes = self
            .inner
            .get_or_set_raw(
                key,
                || async move {
                    let value = f().await?;
                    Ok(serde_json::to_string(&value)?)
                },
                ttl,
            )
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Number of entries on disk (the source of truth).
    pub async fn size(&self) -> TkvResult<usize> {
        self.inner.ensure_open()?;
        self.inner.file.item_count().await
    }

    /// Removes expired entries from both tiers; returns the disk count.
    pub async fn prune(&self) -> TkvResult<usize> {
        self.inner.prune_raw().await
    }

    /// Snapshot of hit/miss counters and both tiers' sizes.
    pub async fn stats(&self) -> TkvResult<CacheStats> {
        self.inner.stats_raw().await
    }

    /// Zeroes the hit/miss counters.
    pub fn reset_stats(&self) {
        self.inner.reset_stats();
    }

    /// Drops every entry from both tiers and cancels pending touches.
    pub async fn clear(&self) -> TkvResult<()> {
        self.inner.clear_raw().await
    }

    /// Shuts the cache down: cancels background tasks and makes every
    /// subsequent operation fail with a closed-cache error.
    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_resolution_rules() {
        let default = Some(Duration::from_secs(10));

        // Explicit TTL wins.
        let at = resolve_expiry(Some(Duration::from_secs(5)), default).expect("expiry");
        assert!(at >= now_ms() + 4_900 && at <= now_ms() + 5_100);

        // Absent TTL falls back to the default.
        let at = resolve_expiry(None, default).expect("expiry");
        assert!(at >= now_ms() + 9_900 && at <= now_ms() + 10_100);

        // Zero opts out of the default entirely.
        assert_eq!(resolve_expiry(Some(Duration::ZERO), default), None);

        // No TTL anywhere means no expiry.
        assert_eq!(resolve_expiry(None, None), None);
    }

    #[test]
    fn fractional_ttls_keep_millisecond_precision() {
        let at = resolve_expiry(Some(Duration::from_millis(50)), None).expect("expiry");
        let delta = at.saturating_sub(now_ms());
        assert!(delta <= 50, "expiry {delta}ms out is too far");
    }
}
