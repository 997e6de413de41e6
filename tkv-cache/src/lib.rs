//! # TierKV
//!
//! Embedded two-tier key/value cache: a bounded in-memory hot tier over a
//! sharded persistent file tier, with Redis-style semantics (`get`/`set`/
//! `del`, TTL, glob listing, batch access) and single-flight cache-aside.
//!
//! Disk is the source of truth; memory holds a hot subset for latency. The
//! cache may drop any entry at any time under pressure, so it is never
//! authoritative storage.
//!
//! ```no_run
//! use tkv_cache::{CacheConfig, TieredCache};
//!
//! # async fn demo() -> tkv_cache::TkvResult<()> {
//! let cache: TieredCache<String> = TieredCache::new(CacheConfig {
//!     dir: "/tmp/app-cache".into(),
//!     ..CacheConfig::default()
//! });
//!
//! cache.set("greeting", &"hello".to_string(), None).await?;
//! assert_eq!(cache.get("greeting").await?, Some("hello".to_string()));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
mod tasks;

pub use cache::{CacheStats, TieredCache};
pub use config::CacheConfig;
pub use tkv_common::hash::{KeyHasher, Md5Hasher};
pub use tkv_common::{TkvError, TkvResult, TtlStatus};
pub use tkv_engine::memory::MemoryStats;
