//! # In-Memory Tier
//!
//! Provide the bounded hot tier: an insertion-ordered mapping from key to
//! serialized value bytes with TTL-aware lookups and LRU eviction that
//! prefers expired entries over live cold ones.
//!
//! ## Design Principles
//!
//! 1. **Byte-Accurate Bounds**: Entries are sized by their serialized value
//!    bytes, so the memory budget tracks real payload weight.
//! 2. **Lazy Expiration**: Expired entries are removed on encounter (get,
//!    has, keys, ttl) or by an explicit prune; no background sweep runs here.
//! 3. **Index-Based LRU**: An intrusive list over a dense node arena gives
//!    O(1) promotion and eviction without heap pointers or unsafe code.
//! 4. **No I/O**: Every operation is synchronous; the coordinator owns the
//!    lock around this store and never holds it across a suspension point.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryStore
//!   ├── map: HashMap<String, usize>
//!   ├── nodes: Vec<Option<Node>>
//!   ├── free: Vec<usize>
//!   └── head/tail: LRU indices
//!         └── Node { key, serialized, expires_at, size, prev, next }
//! ```

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;

use tkv_common::pattern::Matcher;
use tkv_common::types::{is_expired, now_ms, TtlStatus};

/// Internal node representing a single key/value entry.
///
/// Uses an index-based intrusive list for O(1) LRU updates without heap
/// pointers, keeping the layout cache-friendly and safe.
#[derive(Debug)]
struct Node {
    key: String,
    // Serialized value bytes; cheap to clone out to callers.
    serialized: Bytes,
    // Absolute expiration in milliseconds since the epoch.
    expires_at: Option<u64>,
    // Byte size of `serialized`, for eviction accounting.
    size: u64,
    // Intrusive LRU pointers (index-based to keep nodes packed).
    prev: Option<usize>,
    next: Option<usize>,
}

/// Snapshot of the memory tier's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Number of live entries (including not-yet-collected expired ones).
    pub items: usize,
    /// Sum of entry sizes in bytes.
    pub current_size: u64,
    /// Configured entry-count bound.
    pub max_items: usize,
    /// Configured byte bound.
    pub max_size: u64,
}

/// Bounded LRU over serialized value bytes.
///
/// Iteration order of the internal list is LRU-to-MRU; `get` and `touch` move
/// an entry to the MRU end, eviction removes from the LRU end unless an
/// expired entry can be reclaimed first.
#[derive(Debug)]
pub struct MemoryStore {
    /// Key -> node index for O(1) lookup.
    map: HashMap<String, usize, RandomState>,
    /// Dense node storage for cache-friendly scans.
    nodes: Vec<Option<Node>>,
    /// Free-list for recycling node slots.
    free: Vec<usize>,
    /// LRU head (oldest) and tail (most recent).
    head: Option<usize>,
    tail: Option<usize>,
    max_items: usize,
    max_size: u64,
    current_size: u64,
}

impl MemoryStore {
    /// Creates a store bounded by entry count and total payload bytes.
    pub fn new(max_items: usize, max_size: u64) -> Self {
        MemoryStore {
            map: HashMap::with_hasher(RandomState::new()),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            max_items,
            max_size,
            current_size: 0,
        }
    }

    /// Looks up a key, promotes it to MRU, and returns its serialized bytes.
    ///
    /// Expired entries are removed on access.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        let idx = *self.map.get(key)?;
        if self.expired(idx) {
            self.remove_idx(idx);
            return None;
        }
        self.promote(idx);
        self.nodes[idx].as_ref().map(|node| node.serialized.clone())
    }

    /// Same as `get` but without the LRU promotion.
    pub fn peek(&mut self, key: &str) -> Option<Bytes> {
        let idx = *self.map.get(key)?;
        if self.expired(idx) {
            self.remove_idx(idx);
            return None;
        }
        self.nodes[idx].as_ref().map(|node| node.serialized.clone())
    }

    /// Inserts or replaces an entry at the MRU end, evicting as needed.
    ///
    /// An existing entry is removed first so its size is recomputed rather
    /// than patched.
    pub fn set(&mut self, key: &str, serialized: Bytes, expires_at: Option<u64>) {
        if let Some(&idx) = self.map.get(key) {
            self.remove_idx(idx);
        }

        let size = serialized.len() as u64;
        while (self.map.len() >= self.max_items || self.current_size + size > self.max_size)
            && !self.map.is_empty()
        {
            if self.evict_one().is_none() {
                break;
            }
        }

        self.insert_new(key.to_string(), serialized, expires_at, size);
    }

    /// Removes a key; returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        match self.map.get(key) {
            Some(&idx) => {
                self.remove_idx(idx);
                true
            }
            None => false,
        }
    }

    /// Returns whether a live entry exists, removing it if expired.
    pub fn has(&mut self, key: &str) -> bool {
        let Some(&idx) = self.map.get(key) else {
            return false;
        };
        if self.expired(idx) {
            self.remove_idx(idx);
            return false;
        }
        true
    }

    /// Returns all live keys matching `matcher`, dropping expired entries
    /// encountered along the way.
    pub fn keys(&mut self, matcher: &Matcher) -> Vec<String> {
        let now = now_ms();
        let mut stale = Vec::new();
        let mut out = Vec::new();
        for (key, &idx) in &self.map {
            if let Some(node) = self.nodes[idx].as_ref() {
                if is_expired(node.expires_at, now) {
                    stale.push(idx);
                } else if matcher.is_match(key) {
                    out.push(key.clone());
                }
            }
        }
        for idx in stale {
            self.remove_idx(idx);
        }
        out
    }

    /// Replaces the expiry of a live entry in place, without touching its LRU
    /// position. Returns false for missing or expired keys.
    pub fn set_expiry(&mut self, key: &str, expires_at: Option<u64>) -> bool {
        let Some(&idx) = self.map.get(key) else {
            return false;
        };
        if self.expired(idx) {
            self.remove_idx(idx);
            return false;
        }
        if let Some(node) = self.nodes[idx].as_mut() {
            node.expires_at = expires_at;
        }
        true
    }

    /// Promotes a live entry to MRU without reading its value.
    pub fn touch(&mut self, key: &str) -> bool {
        let Some(&idx) = self.map.get(key) else {
            return false;
        };
        if self.expired(idx) {
            self.remove_idx(idx);
            return false;
        }
        self.promote(idx);
        true
    }

    /// Reports TTL state for a key, removing it if expired.
    pub fn get_ttl(&mut self, key: &str) -> TtlStatus {
        let Some(&idx) = self.map.get(key) else {
            return TtlStatus::Missing;
        };
        if self.expired(idx) {
            self.remove_idx(idx);
            return TtlStatus::Missing;
        }
        let expires_at = self.nodes[idx].as_ref().and_then(|node| node.expires_at);
        TtlStatus::from_expiry(expires_at, now_ms())
    }

    /// Removes every expired entry; returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let now = now_ms();
        let stale: Vec<usize> = self
            .map
            .values()
            .copied()
            .filter(|&idx| {
                self.nodes[idx]
                    .as_ref()
                    .is_some_and(|node| is_expired(node.expires_at, now))
            })
            .collect();
        let count = stale.len();
        for idx in stale {
            self.remove_idx(idx);
        }
        count
    }

    /// Drops every entry and resets counters.
    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.current_size = 0;
    }

    /// Snapshot of the tier's counters.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            items: self.map.len(),
            current_size: self.current_size,
            max_items: self.max_items,
            max_size: self.max_size,
        }
    }

    fn expired(&self, idx: usize) -> bool {
        self.nodes[idx]
            .as_ref()
            .is_some_and(|node| is_expired(node.expires_at, now_ms()))
    }

    /// Evicts a single entry: the first expired one in LRU order if any,
    /// otherwise the LRU head. Returns the evicted key.
    fn evict_one(&mut self) -> Option<String> {
        let now = now_ms();
        let mut cursor = self.head;
        let mut victim = None;
        while let Some(idx) = cursor {
            let Some(node) = self.nodes[idx].as_ref() else {
                break;
            };
            if is_expired(node.expires_at, now) {
                victim = Some(idx);
                break;
            }
            cursor = node.next;
        }

        let idx = victim.or(self.head)?;
        let key = self.nodes[idx].as_ref().map(|node| node.key.clone());
        self.remove_idx(idx);
        key
    }

    /// Detaches `idx` from the LRU list.
    ///
    /// Call this before re-linking or removing the node.
    fn lru_remove(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().expect("node exists");
            (node.prev, node.next)
        };

        if let Some(prev_idx) = prev {
            if let Some(prev_node) = self.nodes[prev_idx].as_mut() {
                prev_node.next = next;
            }
        } else {
            self.head = next;
        }

        if let Some(next_idx) = next {
            if let Some(next_node) = self.nodes[next_idx].as_mut() {
                next_node.prev = prev;
            }
        } else {
            self.tail = prev;
        }

        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    /// Appends `idx` to the LRU tail (most recently used).
    fn lru_push_back(&mut self, idx: usize) {
        let tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = tail;
            node.next = None;
        }

        if let Some(tail_idx) = tail {
            if let Some(tail_node) = self.nodes[tail_idx].as_mut() {
                tail_node.next = Some(idx);
            }
        } else {
            self.head = Some(idx);
        }

        self.tail = Some(idx);
    }

    /// Marks a node as recently used by moving it to the tail.
    fn promote(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        self.lru_remove(idx);
        self.lru_push_back(idx);
    }

    /// Inserts a new node at the MRU end, reusing a free slot when possible.
    fn insert_new(&mut self, key: String, serialized: Bytes, expires_at: Option<u64>, size: u64) {
        let idx = self.free.pop().unwrap_or_else(|| {
            self.nodes.push(None);
            self.nodes.len() - 1
        });

        self.nodes[idx] = Some(Node {
            key: key.clone(),
            serialized,
            expires_at,
            size,
            prev: None,
            next: None,
        });
        self.lru_push_back(idx);
        self.map.insert(key, idx);
        self.current_size += size;
    }

    /// Removes a node by index, updating the map, LRU links, free list, and
    /// size counter.
    fn remove_idx(&mut self, idx: usize) {
        let Some(node) = self.nodes[idx].as_ref() else {
            return;
        };
        let key = node.key.clone();
        let size = node.size;

        // Detach before clearing the slot so LRU pointers stay valid.
        self.lru_remove(idx);
        self.nodes[idx] = None;
        self.map.remove(&key);
        self.free.push(idx);
        self.current_size -= size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    fn past() -> Option<u64> {
        Some(now_ms().saturating_sub(10))
    }

    fn future() -> Option<u64> {
        Some(now_ms() + 60_000)
    }

    #[test]
    fn set_get_roundtrip() {
        let mut store = MemoryStore::new(8, 1024);
        store.set("alpha", bytes("\"value\""), None);
        assert_eq!(store.get("alpha"), Some(bytes("\"value\"")));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn expired_entry_treated_missing() {
        let mut store = MemoryStore::new(8, 1024);
        store.set("alpha", bytes("1"), past());
        assert_eq!(store.get("alpha"), None);
        assert_eq!(store.stats().items, 0);
        assert_eq!(store.stats().current_size, 0);
    }

    #[test]
    fn item_bound_evicts_oldest() {
        let mut store = MemoryStore::new(2, 1024);
        store.set("a", bytes("1"), None);
        store.set("b", bytes("2"), None);
        store.set("c", bytes("3"), None);

        assert_eq!(store.stats().items, 2);
        assert_eq!(store.get("a"), None);
        assert!(store.has("b"));
        assert!(store.has("c"));
    }

    #[test]
    fn get_promotes_against_eviction() {
        let mut store = MemoryStore::new(2, 1024);
        store.set("a", bytes("1"), None);
        store.set("b", bytes("2"), None);
        store.get("a");
        store.set("c", bytes("3"), None);

        assert!(store.has("a"));
        assert_eq!(store.get("b"), None);
    }

    #[test]
    fn peek_does_not_promote() {
        let mut store = MemoryStore::new(2, 1024);
        store.set("a", bytes("1"), None);
        store.set("b", bytes("2"), None);
        store.peek("a");
        store.set("c", bytes("3"), None);

        assert_eq!(store.get("a"), None);
        assert!(store.has("b"));
    }

    #[test]
    fn byte_bound_evicts_until_fit() {
        let mut store = MemoryStore::new(8, 10);
        store.set("a", bytes("1234"), None);
        store.set("b", bytes("1234"), None);
        store.set("c", bytes("12345678"), None);

        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), None);
        assert!(store.has("c"));
        assert_eq!(store.stats().current_size, 8);
    }

    #[test]
    fn eviction_prefers_expired_over_cold() {
        let mut store = MemoryStore::new(2, 1024);
        store.set("cold", bytes("1"), None);
        store.set("stale", bytes("2"), past());
        store.set("new", bytes("3"), None);

        assert!(store.has("cold"));
        assert!(store.has("new"));
        assert_eq!(store.stats().items, 2);
    }

    #[test]
    fn overwrite_recomputes_size() {
        let mut store = MemoryStore::new(8, 1024);
        store.set("a", bytes("123456"), None);
        store.set("a", bytes("12"), None);
        assert_eq!(store.stats().items, 1);
        assert_eq!(store.stats().current_size, 2);
    }

    #[test]
    fn delete_removes_and_reports() {
        let mut store = MemoryStore::new(8, 1024);
        store.set("a", bytes("1"), None);
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert_eq!(store.stats().current_size, 0);
    }

    #[test]
    fn keys_filters_by_pattern_and_drops_expired() {
        let mut store = MemoryStore::new(8, 1024);
        store.set("user:1", bytes("1"), None);
        store.set("user:2", bytes("2"), past());
        store.set("session:1", bytes("3"), None);

        let matcher = Matcher::compile("user:*").expect("compile");
        let keys = store.keys(&matcher);
        assert_eq!(keys, vec!["user:1".to_string()]);
        // The expired entry was collected during the scan.
        assert_eq!(store.stats().items, 2);
    }

    #[test]
    fn set_expiry_and_ttl_sentinels() {
        let mut store = MemoryStore::new(8, 1024);
        assert_eq!(store.get_ttl("missing"), TtlStatus::Missing);

        store.set("a", bytes("1"), None);
        assert_eq!(store.get_ttl("a"), TtlStatus::NoExpiry);

        assert!(store.set_expiry("a", future()));
        assert!(matches!(store.get_ttl("a"), TtlStatus::ExpiresIn(_)));

        assert!(store.set_expiry("a", None));
        assert_eq!(store.get_ttl("a"), TtlStatus::NoExpiry);

        assert!(!store.set_expiry("missing", future()));
    }

    #[test]
    fn touch_promotes_without_reading() {
        let mut store = MemoryStore::new(2, 1024);
        store.set("a", bytes("1"), None);
        store.set("b", bytes("2"), None);
        assert!(store.touch("a"));
        store.set("c", bytes("3"), None);

        assert!(store.has("a"));
        assert_eq!(store.get("b"), None);
        assert!(!store.touch("missing"));
    }

    #[test]
    fn prune_removes_all_expired() {
        let mut store = MemoryStore::new(8, 1024);
        store.set("a", bytes("1"), past());
        store.set("b", bytes("2"), past());
        store.set("c", bytes("3"), None);

        assert_eq!(store.prune(), 2);
        assert_eq!(store.stats().items, 1);
    }

    #[test]
    fn clear_resets_everything() {
        let mut store = MemoryStore::new(8, 1024);
        store.set("a", bytes("1"), None);
        store.set("b", bytes("2"), None);
        store.clear();

        assert_eq!(store.stats().items, 0);
        assert_eq!(store.stats().current_size, 0);
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn slot_reuse_after_churn() {
        let mut store = MemoryStore::new(4, 1024);
        for round in 0..16 {
            let key = format!("k{}", round % 4);
            store.set(&key, bytes("payload"), None);
        }
        assert!(store.stats().items <= 4);
        // The arena should not have grown past the live bound plus churn slack.
        assert!(store.nodes.len() <= 8);
    }
}
