// tkv-engine - Storage tiers for the TierKV two-tier cache
//
// This crate provides the bounded in-memory LRU tier and the sharded
// persistent file tier. Coordination between the two lives in tkv-cache.

pub mod file;
pub mod memory;

pub use file::{EvictionCallback, FileStore, FileStoreConfig, StoredEntry};
pub use memory::{MemoryStats, MemoryStore};
