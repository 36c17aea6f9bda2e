//! Secondary cache tiers.
//!
//! A tier stores opaque bytes under string keys. Failures are reported as
//! [`CacheError`]s; the cache manager treats every failure as a miss.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::CacheError;

/// A larger, possibly slower, cache tier behind the in-process LRU.
pub trait CacheTier: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores `value`; `ttl` of `None` never expires.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Removes `key`. Returns true if it was present.
    fn remove(&self, key: &str) -> Result<bool, CacheError>;

    fn clear(&self) -> Result<(), CacheError>;
}

struct Stored {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

/// A bounded in-memory tier. Expired entries are dropped lazily on access or
/// when room is needed.
pub struct MemoryTier {
    entries: Mutex<HashMap<String, Stored>>,
    capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stored>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(stored) if stored.expires_at.is_some_and(|at| now >= at) => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.bytes.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut entries = self.lock();
        let now = Instant::now();
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            entries.retain(|_, stored| stored.expires_at.is_none_or(|at| now < at));
            if entries.len() >= self.capacity {
                return Err(CacheError::Full {
                    tier: self.name().to_string(),
                    capacity: self.capacity,
                });
            }
        }
        entries.insert(
            key.to_string(),
            Stored {
                bytes: value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock().remove(key).is_some())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.lock().clear();
        Ok(())
    }
}
