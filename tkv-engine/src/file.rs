//! # File Tier
//!
//! Provide the durable tier: sharded single-file-per-entry storage with an
//! in-memory index, atomic temp-and-rename writes, and space/TTL eviction
//! that reports removals back to the owner through an eviction callback.
//!
//! ## Design Principles
//!
//! 1. **Index In Memory, Data On Disk**: Every metadata question (existence,
//!    TTL, size, listing) is answered from the in-memory index; file I/O only
//!    happens for values.
//! 2. **Atomic Writes**: Entries are written to a uniquely named temp file in
//!    the root and renamed into their shard; readers see the old file or the
//!    new one, never a partial.
//! 3. **Self-Healing**: Unreadable or undecodable files are dropped from the
//!    index and reported as misses; corruption never propagates as an error.
//! 4. **Short Locks**: The index mutex is never held across a suspension
//!    point; file operations run against paths captured under the lock.
//!
//! ## Layout
//!
//! ```text
//! <dir>/
//!   00/ .. <ff>/          shard directories (two-hex-char names)
//!     <hash>.json         one entry per file, named by the key digest
//!   .tmp-<unique>         transient files used by atomic writes
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use tkv_common::codec::{self, Compression};
use tkv_common::hash::{shard_dir_name, shard_index, KeyHasher, Md5Hasher};
use tkv_common::pattern::Matcher;
use tkv_common::types::{is_expired, now_ms, system_time_ms, Envelope, TtlStatus};
use tkv_common::TkvResult;

/// Upcall fired when the store removes an entry for any reason other than an
/// explicit `delete` (space eviction, hash collision), so the owner can
/// mirror the removal in the hot tier.
pub type EvictionCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Configuration for a [`FileStore`].
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Root directory; created on first use.
    pub dir: PathBuf,
    /// Number of shard subdirectories. Must match across restarts on the
    /// same directory, or the rebuilt index will disagree with new writes.
    pub shards: usize,
    /// Byte bound that triggers eviction.
    pub max_size: u64,
    /// Compression applied to new writes; reads autodetect.
    pub compression: Compression,
}

/// Index record for one on-disk entry.
#[derive(Debug, Clone)]
struct IndexEntry {
    /// 32-hex key digest; doubles as the file stem.
    hash: String,
    expires_at: Option<u64>,
    last_accessed_at: u64,
    /// On-disk size in bytes, after the codec.
    size: u64,
}

/// A decoded entry returned by `get`/`peek`.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// Full key the entry was written under.
    pub key: String,
    /// Serialized value bytes (codec output for the value only).
    pub value: Bytes,
    /// Absolute expiry in milliseconds, if any.
    pub expires_at: Option<u64>,
}

#[derive(Default)]
struct IndexState {
    index: HashMap<String, IndexEntry>,
    hash_to_key: HashMap<String, String>,
    total_size: u64,
}

/// Removes `key` from the index, keeping the hash map and size counter
/// consistent. Returns the removed record.
fn remove_key(state: &mut IndexState, key: &str) -> Option<IndexEntry> {
    let entry = state.index.remove(key)?;
    state.hash_to_key.remove(&entry.hash);
    state.total_size = state.total_size.saturating_sub(entry.size);
    Some(entry)
}

/// Outcome of an index lookup performed under the lock.
enum Gate {
    Miss,
    Expired(PathBuf),
    Live(PathBuf),
}

/// Sharded persistent store with an in-memory index.
pub struct FileStore {
    config: FileStoreConfig,
    hasher: Arc<dyn KeyHasher>,
    state: Mutex<IndexState>,
    init: OnceCell<()>,
    on_evict: EvictionCallback,
    temp_counter: AtomicU64,
}

impl FileStore {
    /// Creates a store with the default MD5 key digest.
    ///
    /// No I/O happens here; directories are created and the index rebuilt
    /// lazily on the first operation.
    pub fn new(config: FileStoreConfig, on_evict: EvictionCallback) -> Self {
        Self::with_hasher(config, Arc::new(Md5Hasher), on_evict)
    }

    /// Creates a store with a caller-provided key digest.
    ///
    /// The digest must be deterministic and stable across restarts.
    pub fn with_hasher(
        config: FileStoreConfig,
        hasher: Arc<dyn KeyHasher>,
        on_evict: EvictionCallback,
    ) -> Self {
        FileStore {
            config,
            hasher,
            state: Mutex::new(IndexState::default()),
            init: OnceCell::new(),
            on_evict,
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Reads and decodes an entry, bumping its access time.
    ///
    /// Returns `None` for missing, expired, or unreadable entries, and for
    /// stale hash entries whose decoded key does not match the request.
    pub async fn get(&self, key: &str) -> TkvResult<Option<StoredEntry>> {
        self.read_entry(key, true).await
    }

    /// Same as `get` but without updating the access time.
    pub async fn peek(&self, key: &str) -> TkvResult<Option<StoredEntry>> {
        self.read_entry(key, false).await
    }

    /// Writes a pre-serialized envelope for `key`.
    ///
    /// Evicts a colliding owner of the same digest if one exists, frees space
    /// for the new payload, then atomically writes the file and updates the
    /// index. Write failures propagate; nothing is indexed in that case.
    pub async fn set(&self, key: &str, envelope: &[u8], expires_at: Option<u64>) -> TkvResult<()> {
        self.ensure_init().await?;
        let bytes = codec::encode(envelope, self.config.compression)?;
        let size = bytes.len() as u64;
        let hash = self.hasher.digest(key);
        let path = self.entry_path(&hash);

        let (collided, victims) = {
            let mut state = self.state.lock();
            if state.index.contains_key(key) {
                remove_key(&mut state, key);
            }
            let collided = match state.hash_to_key.get(&hash) {
                Some(owner) if owner != key => {
                    let owner = owner.clone();
                    remove_key(&mut state, &owner);
                    Some(owner)
                }
                _ => None,
            };
            let victims = self.ensure_space(&mut state, size);
            (collided, victims)
        };

        // The colliding entry shares the target path, so the write below
        // replaces its file; only the upcall is needed.
        if let Some(owner) = collided {
            (self.on_evict)(&owner);
        }
        for (victim, victim_path) in victims {
            (self.on_evict)(&victim);
            let _ = tokio::fs::remove_file(&victim_path).await;
        }

        self.atomic_write(&path, &bytes).await?;

        let mut state = self.state.lock();
        state.index.insert(
            key.to_string(),
            IndexEntry {
                hash: hash.clone(),
                expires_at,
                last_accessed_at: now_ms(),
                size,
            },
        );
        state.hash_to_key.insert(hash, key.to_string());
        state.total_size += size;
        Ok(())
    }

    /// Removes an entry; returns whether it was present in the index.
    ///
    /// The index is updated first, then the file is unlinked best-effort.
    pub async fn delete(&self, key: &str) -> TkvResult<bool> {
        self.ensure_init().await?;
        let removed = {
            let mut state = self.state.lock();
            remove_key(&mut state, key)
        };
        match removed {
            Some(entry) => {
                let _ = tokio::fs::remove_file(self.entry_path(&entry.hash)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Index-only existence check with lazy expiry collection.
    pub async fn has(&self, key: &str) -> TkvResult<bool> {
        self.ensure_init().await?;
        let gate = self.gate(key);
        match gate {
            Gate::Miss => Ok(false),
            Gate::Expired(path) => {
                self.spawn_unlink(path);
                Ok(false)
            }
            Gate::Live(_) => Ok(true),
        }
    }

    /// Returns all live keys matching `matcher`.
    ///
    /// Expired entries discovered during the scan are dropped from the index
    /// and their files deleted in parallel.
    pub async fn keys(&self, matcher: &Matcher) -> TkvResult<Vec<String>> {
        self.ensure_init().await?;
        let now = now_ms();
        let (matches, stale) = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .index
                .iter()
                .filter(|(_, entry)| is_expired(entry.expires_at, now))
                .map(|(key, _)| key.clone())
                .collect();
            let mut stale = Vec::with_capacity(expired.len());
            for key in expired {
                if let Some(entry) = remove_key(&mut state, &key) {
                    stale.push(self.entry_path(&entry.hash));
                }
            }
            let matches = state
                .index
                .keys()
                .filter(|key| matcher.is_match(key))
                .cloned()
                .collect();
            (matches, stale)
        };
        for path in stale {
            self.spawn_unlink(path);
        }
        Ok(matches)
    }

    /// Rewrites an entry with a new expiry.
    ///
    /// The file is re-encoded and atomically replaced; the indexed size is
    /// refreshed because the envelope length changes with the expiry field.
    /// Returns false for missing, expired, or unreadable entries.
    pub async fn set_expiry(&self, key: &str, expires_at: Option<u64>) -> TkvResult<bool> {
        self.ensure_init().await?;
        let path = match self.gate(key) {
            Gate::Miss => return Ok(false),
            Gate::Expired(path) => {
                self.spawn_unlink(path);
                return Ok(false);
            }
            Gate::Live(path) => path,
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(key, error = %err, "dropping unreadable entry");
                self.forget(key);
                return Ok(false);
            }
        };
        let mut envelope = match Self::parse_envelope(&bytes) {
            Some(envelope) => envelope,
            None => {
                debug!(key, "dropping undecodable entry");
                self.forget(key);
                return Ok(false);
            }
        };

        envelope.expires_at = expires_at;
        let plain = envelope.to_bytes()?;
        let encoded = codec::encode(&plain, self.config.compression)?;
        let new_size = encoded.len() as u64;
        self.atomic_write(&path, &encoded).await?;

        let mut state = self.state.lock();
        let sizes = state.index.get_mut(key).map(|entry| {
            let old = entry.size;
            entry.size = new_size;
            entry.expires_at = expires_at;
            old
        });
        if let Some(old) = sizes {
            state.total_size = state.total_size - old + new_size;
        }
        Ok(true)
    }

    /// Bumps an entry's access time in the index and, best-effort, the file
    /// mtime so the recency survives a restart.
    pub async fn touch(&self, key: &str) -> TkvResult<bool> {
        self.ensure_init().await?;
        let now = now_ms();
        let gate = {
            let mut state = self.state.lock();
            match state.index.get_mut(key) {
                None => Gate::Miss,
                Some(entry) if is_expired(entry.expires_at, now) => {
                    let path = self.entry_path(&entry.hash);
                    remove_key(&mut state, key);
                    Gate::Expired(path)
                }
                Some(entry) => {
                    entry.last_accessed_at = now;
                    Gate::Live(self.entry_path(&entry.hash))
                }
            }
        };

        match gate {
            Gate::Miss => Ok(false),
            Gate::Expired(path) => {
                self.spawn_unlink(path);
                Ok(false)
            }
            Gate::Live(path) => {
                tokio::task::spawn_blocking(move || {
                    let _ = std::fs::OpenOptions::new()
                        .append(true)
                        .open(&path)
                        .and_then(|file| file.set_modified(SystemTime::now()));
                });
                Ok(true)
            }
        }
    }

    /// Reports TTL state for a key from the index alone.
    pub async fn get_ttl(&self, key: &str) -> TkvResult<TtlStatus> {
        self.ensure_init().await?;
        match self.gate(key) {
            Gate::Miss => Ok(TtlStatus::Missing),
            Gate::Expired(path) => {
                self.spawn_unlink(path);
                Ok(TtlStatus::Missing)
            }
            Gate::Live(_) => {
                let state = self.state.lock();
                let expires_at = state.index.get(key).and_then(|entry| entry.expires_at);
                Ok(TtlStatus::from_expiry(expires_at, now_ms()))
            }
        }
    }

    /// Removes every expired entry; returns how many were dropped.
    pub async fn prune(&self) -> TkvResult<usize> {
        self.ensure_init().await?;
        let now = now_ms();
        let stale: Vec<PathBuf> = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .index
                .iter()
                .filter(|(_, entry)| is_expired(entry.expires_at, now))
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|key| remove_key(&mut state, &key))
                .map(|entry| self.entry_path(&entry.hash))
                .collect()
        };
        let count = stale.len();
        for path in stale {
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(count)
    }

    /// Drops every entry: shard contents are wiped in parallel and the index
    /// reset.
    pub async fn clear(&self) -> TkvResult<()> {
        self.ensure_init().await?;
        {
            let mut state = self.state.lock();
            state.index.clear();
            state.hash_to_key.clear();
            state.total_size = 0;
        }

        let mut tasks = JoinSet::new();
        for shard in 0..self.config.shards {
            let dir = self.shard_path(shard);
            tasks.spawn(async move {
                let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                    return;
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Total indexed bytes on disk.
    pub async fn size(&self) -> TkvResult<u64> {
        self.ensure_init().await?;
        Ok(self.state.lock().total_size)
    }

    /// Number of indexed entries.
    pub async fn item_count(&self) -> TkvResult<usize> {
        self.ensure_init().await?;
        Ok(self.state.lock().index.len())
    }

    // -- internal ---------------------------------------------------------

    async fn ensure_init(&self) -> TkvResult<()> {
        self.init
            .get_or_try_init(|| async { self.load_index().await })
            .await?;
        Ok(())
    }

    /// Builds directories and rebuilds the index from disk.
    ///
    /// Expired files are deleted, malformed files skipped; directory creation
    /// failures propagate.
    async fn load_index(&self) -> TkvResult<()> {
        tokio::fs::create_dir_all(&self.config.dir).await?;
        for shard in 0..self.config.shards {
            let dir = self.shard_path(shard);
            tokio::fs::create_dir_all(&dir).await?;

            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                match self.load_file(&path).await {
                    Some((hash, envelope, size, accessed)) => {
                        if is_expired(envelope.expires_at, now_ms()) {
                            let _ = tokio::fs::remove_file(&path).await;
                            continue;
                        }
                        let mut state = self.state.lock();
                        if state.index.contains_key(&envelope.key) {
                            continue;
                        }
                        state.hash_to_key.insert(hash.clone(), envelope.key.clone());
                        state.total_size += size;
                        state.index.insert(
                            envelope.key,
                            IndexEntry {
                                hash,
                                expires_at: envelope.expires_at,
                                last_accessed_at: accessed,
                                size,
                            },
                        );
                    }
                    None => {
                        warn!(path = %path.display(), "skipping unreadable cache file");
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads one file during index load: (hash, envelope, size, mtime ms).
    async fn load_file(&self, path: &Path) -> Option<(String, Envelope, u64, u64)> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        let bytes = tokio::fs::read(path).await.ok()?;
        let envelope = Self::parse_envelope(&bytes)?;
        let hash = path.file_stem()?.to_str()?.to_string();
        let accessed = meta
            .modified()
            .map(system_time_ms)
            .unwrap_or_else(|_| now_ms());
        Some((hash, envelope, meta.len(), accessed))
    }

    async fn read_entry(&self, key: &str, touch_access: bool) -> TkvResult<Option<StoredEntry>> {
        self.ensure_init().await?;
        let path = match self.gate(key) {
            Gate::Miss => return Ok(None),
            Gate::Expired(path) => {
                self.spawn_unlink(path);
                return Ok(None);
            }
            Gate::Live(path) => path,
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(key, error = %err, "dropping unreadable entry");
                self.forget(key);
                return Ok(None);
            }
        };
        let envelope = match Self::parse_envelope(&bytes) {
            Some(envelope) => envelope,
            None => {
                debug!(key, "dropping undecodable entry");
                self.forget(key);
                return Ok(None);
            }
        };
        if envelope.key != key {
            // A previous owner of this digest left its file behind; the index
            // entry pointed at data that was never ours.
            debug!(key, stored = %envelope.key, "dropping stale hash entry");
            self.forget(key);
            return Ok(None);
        }

        if touch_access {
            let mut state = self.state.lock();
            if let Some(entry) = state.index.get_mut(key) {
                entry.last_accessed_at = now_ms();
            }
        }

        Ok(Some(StoredEntry {
            value: Bytes::copy_from_slice(envelope.value_json().as_bytes()),
            key: envelope.key,
            expires_at: envelope.expires_at,
        }))
    }

    /// Classifies a key under the lock, collecting it when expired.
    fn gate(&self, key: &str) -> Gate {
        let now = now_ms();
        let mut state = self.state.lock();
        match state.index.get(key) {
            None => Gate::Miss,
            Some(entry) if is_expired(entry.expires_at, now) => {
                let path = self.entry_path(&entry.hash);
                remove_key(&mut state, key);
                Gate::Expired(path)
            }
            Some(entry) => Gate::Live(self.entry_path(&entry.hash)),
        }
    }

    /// Drops a key from the index without touching its file.
    fn forget(&self, key: &str) {
        let mut state = self.state.lock();
        remove_key(&mut state, key);
    }

    /// Frees space for `needed` bytes. Phase one reclaims expired entries;
    /// phase two evicts the coldest live entries by access time. Returns the
    /// victims whose callbacks and unlinks the caller must run.
    fn ensure_space(&self, state: &mut IndexState, needed: u64) -> Vec<(String, PathBuf)> {
        let projected = state.total_size.saturating_add(needed);
        if projected <= self.config.max_size {
            return Vec::new();
        }
        let mut target = projected - self.config.max_size;
        let now = now_ms();
        let mut victims = Vec::new();

        let expired: Vec<String> = state
            .index
            .iter()
            .filter(|(_, entry)| is_expired(entry.expires_at, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if target == 0 {
                break;
            }
            if let Some(entry) = remove_key(state, &key) {
                target = target.saturating_sub(entry.size);
                victims.push((key, self.entry_path(&entry.hash)));
            }
        }

        while target > 0 && !state.index.is_empty() {
            let coldest = state
                .index
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed_at)
                .map(|(key, _)| key.clone());
            let Some(key) = coldest else {
                break;
            };
            if let Some(entry) = remove_key(state, &key) {
                target = target.saturating_sub(entry.size);
                victims.push((key, self.entry_path(&entry.hash)));
            }
        }
        victims
    }

    fn parse_envelope(bytes: &[u8]) -> Option<Envelope> {
        let plain = codec::decode(bytes).ok()?;
        Envelope::from_bytes(&plain).ok()
    }

    /// Writes bytes to a temp file in the root, then renames into place.
    ///
    /// The temp file stays on the same filesystem as the target, so the
    /// rename is atomic. On failure the temp file is removed best-effort and
    /// the error propagates.
    async fn atomic_write(&self, target: &Path, bytes: &[u8]) -> TkvResult<()> {
        let tmp = self.temp_path();
        if let Err(err) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.config
            .dir
            .join(format!(".tmp-{}-{nanos:x}-{seq:x}", std::process::id()))
    }

    fn spawn_unlink(&self, path: PathBuf) {
        tokio::spawn(async move {
            let _ = tokio::fs::remove_file(&path).await;
        });
    }

    fn shard_path(&self, shard: usize) -> PathBuf {
        self.config.dir.join(shard_dir_name(shard))
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.shard_path(shard_index(hash, self.config.shards))
            .join(format!("{hash}.json"))
    }
}
