//! Tiered result cache.
//!
//! - [`key`] derives content-addressed keys from configuration values.
//! - [`lru`] is the bounded in-process tier.
//! - [`tier`] defines secondary tiers and provides an in-memory one.
//! - [`manager`] ties the tiers together with tags, TTLs and statistics.

pub mod key;
pub mod lru;
pub mod manager;
pub mod tier;

pub use key::{CacheKeyGenerator, CustomOperation, Operation, VOLATILE_FIELDS};
pub use lru::CacheEntry;
pub use manager::{CacheManager, CacheManagerBuilder, CacheStats, SetOptions};
pub use tier::{CacheTier, MemoryTier};

/// The invalidation surface of a cache, independent of its value type.
pub trait CacheInvalidator: Send + Sync {
    /// Removes one key. Returns true if it was cached.
    fn invalidate_key(&self, key: &str) -> bool;

    /// Removes entries carrying any of `tags`.
    fn invalidate_tags(&self, tags: &[String]) -> usize;

    /// Removes entries whose key starts with `prefix`.
    fn invalidate_prefix(&self, prefix: &str) -> usize;

    /// Removes entries whose key matches a `*` wildcard pattern.
    fn invalidate_pattern(&self, pattern: &str) -> usize;

    /// Drops expired entries.
    fn purge_expired(&self) -> usize;

    /// True if `key` is held by any tier.
    fn contains_key(&self, key: &str) -> bool;
}
