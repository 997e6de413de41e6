//! Cache configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::TieredCache`].
///
/// All fields have workable defaults; construct with struct-update syntax:
/// `CacheConfig { dir: "...".into(), ..CacheConfig::default() }`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory for the file tier.
    pub dir: PathBuf,
    /// Maximum number of entries held in memory.
    pub max_memory_items: usize,
    /// Memory byte bound; also the per-value eligibility bound, so a single
    /// value larger than this never occupies memory.
    pub max_memory_size: u64,
    /// Disk byte bound that triggers eviction.
    pub max_disk_size: u64,
    /// Number of shard directories. Must match across restarts on the same
    /// directory.
    pub shards: usize,
    /// Applied when a write omits its TTL. A per-call `Duration::ZERO`
    /// overrides this back to "no expiry".
    pub default_ttl: Option<Duration>,
    /// Prefix applied to every key as `<namespace>:`.
    pub namespace: Option<String>,
    /// Gzip-compress new writes. Reads autodetect, so this can be toggled
    /// freely between runs.
    pub gzip: bool,
    /// Cadence of the periodic prune task; unset disables it.
    pub prune_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            dir: PathBuf::from(".cache"),
            max_memory_items: 1000,
            max_memory_size: 50 * 1024 * 1024,
            max_disk_size: 500 * 1024 * 1024,
            shards: 16,
            default_ttl: None,
            namespace: None,
            gzip: false,
            prune_interval: None,
        }
    }
}
