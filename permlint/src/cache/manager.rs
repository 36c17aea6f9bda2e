//! The tiered cache manager.
//!
//! Reads go to the in-process LRU first, then to the secondary tier (if any);
//! a secondary hit is promoted back into the LRU. Writes always land in the
//! LRU synchronously. With write-through enabled they are mirrored to the
//! secondary tier, either inline or on a dedicated writer thread.
//!
//! A key index (key → tags, tag → keys) covers every key the manager has
//! written, in either tier, so tag, prefix and pattern invalidation never scan
//! the tiers themselves.
//!
//! Tier failures never reach callers: they are logged, counted in
//! [`CacheStats::errors`] and treated as misses.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument, trace, warn};

use super::CacheInvalidator;
use super::lru::{CacheEntry, Lookup, LruTier};
use super::tier::{CacheTier, MemoryTier};
use crate::error::{CacheError, PermlintError, Result};
use crate::metrics::MetricsCollector;
use crate::rules::normalize::wildcard_matches;
use crate::settings::CacheSettings;

/// Options for [`CacheManager::set`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    pub tags: Vec<String>,
    /// Overrides the default TTL.
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Cumulative cache counters plus the current L1 footprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub errors: u64,
    pub l1_entries: usize,
    pub l1_bytes: usize,
    pub l2_hits: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
    errors: AtomicU64,
    l2_hits: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// What the secondary tier stores for each key.
#[derive(Serialize, Deserialize)]
struct Envelope<V> {
    value: V,
    tags: Vec<String>,
    /// Unix time in milliseconds; `None` never expires.
    expires_at_ms: Option<u64>,
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct IndexEntry {
    tags: Vec<String>,
    expires_at: Option<Instant>,
    in_l1: bool,
    /// Written (or queued for writing) to the secondary tier.
    in_l2: bool,
}

/// Tags and residency of every key held by either tier. A key is dropped
/// once neither tier holds it.
#[derive(Default)]
struct KeyIndex {
    entries: HashMap<String, IndexEntry>,
    keys_by_tag: HashMap<String, HashSet<String>>,
}

impl KeyIndex {
    /// Records a key that was just stored in L1.
    fn insert(&mut self, key: &str, tags: &[String], expires_at: Option<Instant>, in_l2: bool) {
        let was_in_l2 = self.entries.get(key).is_some_and(|entry| entry.in_l2);
        self.remove(key);
        for tag in tags {
            self.keys_by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.entries.insert(
            key.to_string(),
            IndexEntry {
                tags: tags.to_vec(),
                expires_at,
                in_l1: true,
                in_l2: in_l2 || was_in_l2,
            },
        );
    }

    fn left_l1(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.in_l1 = false;
            if !entry.in_l2 {
                self.remove(key);
            }
        }
    }

    fn left_l2(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.in_l2 = false;
            if !entry.in_l1 {
                self.remove(key);
            }
        }
    }

    fn in_l2(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.in_l2)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn remove(&mut self, key: &str) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        for tag in entry.tags {
            if let Some(keys) = self.keys_by_tag.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.keys_by_tag.remove(&tag);
                }
            }
        }
    }

    /// Keys whose TTL has passed.
    fn expired(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| now >= at))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn keys_with_any_tag(&self, tags: &[String]) -> HashSet<String> {
        tags.iter()
            .filter_map(|tag| self.keys_by_tag.get(tag))
            .flatten()
            .cloned()
            .collect()
    }

    fn keys_matching(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        self.entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.keys_by_tag.clear();
    }
}

fn lock_index(index: &Mutex<KeyIndex>) -> MutexGuard<'_, KeyIndex> {
    index.lock().unwrap_or_else(|e| e.into_inner())
}

enum WriteOp {
    Set {
        key: String,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Acknowledged once every earlier operation has been applied.
    Flush(Sender<()>),
}

/// Background writer for the secondary tier. Stops and joins on drop after
/// applying everything already queued.
struct Writer {
    tx: Option<Sender<WriteOp>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Writer {
    fn spawn(
        tier: Arc<dyn CacheTier>,
        index: Arc<Mutex<KeyIndex>>,
        counters: Arc<Counters>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteOp>();
        let thread = thread::Builder::new()
            .name("permlint-cache-writer".into())
            .spawn(move || {
                for op in rx {
                    match op {
                        WriteOp::Set { key, bytes, ttl } => {
                            if let Err(e) = tier.set(&key, bytes, ttl) {
                                warn!(tier = tier.name(), key = %key, error = %e, "async write-through failed");
                                bump(&counters.errors, 1);
                                if let Some(metrics) = &metrics {
                                    metrics.record_error();
                                }
                                discard_l2(&*tier, &index, &key);
                            }
                        }
                        WriteOp::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|source| PermlintError::SpawnError {
                name: "cache writer",
                source,
            })?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    fn send(&self, op: WriteOp) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(op).is_ok())
    }

    /// Waits until all queued writes have been applied.
    fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.send(WriteOp::Flush(ack_tx)) {
            let _ = ack_rx.recv();
        }
    }
}

/// Drops whatever the secondary tier still holds for `key` after a failed
/// write, so an older value cannot be served in place of the new one.
fn discard_l2(tier: &dyn CacheTier, index: &Mutex<KeyIndex>, key: &str) {
    if let Err(e) = tier.remove(key) {
        debug!(tier = tier.name(), key, error = %e, "could not discard stale entry");
    }
    lock_index(index).left_l2(key);
}

impl Drop for Writer {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Builds a [`CacheManager`].
pub struct CacheManagerBuilder<V> {
    settings: CacheSettings,
    tier: Option<Arc<dyn CacheTier>>,
    metrics: Option<Arc<MetricsCollector>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> CacheManagerBuilder<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Uses `tier` as the secondary tier instead of the built-in memory tier.
    pub fn tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<CacheManager<V>> {
        let settings = self.settings;
        let counters = Arc::new(Counters::default());

        let l2 = if settings.write_through {
            Some(self.tier.unwrap_or_else(|| {
                Arc::new(MemoryTier::new(settings.l2_max_entries)) as Arc<dyn CacheTier>
            }))
        } else {
            self.tier
        };

        let index = Arc::new(Mutex::new(KeyIndex::default()));
        let writer = match &l2 {
            Some(tier) if settings.write_through && settings.async_write_through => Some(Writer::spawn(
                tier.clone(),
                index.clone(),
                counters.clone(),
                self.metrics.clone(),
            )?),
            _ => None,
        };

        Ok(CacheManager {
            l1: Mutex::new(LruTier::new(settings.max_entries, settings.max_memory_bytes)),
            index,
            l2,
            writer: Mutex::new(writer),
            counters,
            metrics: self.metrics,
            destroyed: AtomicBool::new(false),
            settings,
        })
    }
}

/// Two-tier cache for serializable values.
pub struct CacheManager<V> {
    settings: CacheSettings,
    l1: Mutex<LruTier<V>>,
    index: Arc<Mutex<KeyIndex>>,
    l2: Option<Arc<dyn CacheTier>>,
    writer: Mutex<Option<Writer>>,
    counters: Arc<Counters>,
    metrics: Option<Arc<MetricsCollector>>,
    destroyed: AtomicBool,
}

impl<V> CacheManager<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    pub fn builder(settings: CacheSettings) -> CacheManagerBuilder<V> {
        CacheManagerBuilder {
            settings,
            tier: None,
            metrics: None,
            _value: PhantomData,
        }
    }

    /// A cache with the given settings and no metrics.
    pub fn new(settings: CacheSettings) -> Result<Self> {
        Self::builder(settings).build()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Returns the cached value for `key`, if any.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn get(&self, key: &str) -> Option<V> {
        let started = Instant::now();
        if self.is_destroyed() {
            return None;
        }

        let lookup = self.lock_l1().get(key, started);
        match lookup {
            Lookup::Hit(value) => {
                self.record_hit(started);
                trace!(key, "cache hit");
                return Some(value);
            }
            Lookup::Expired(_) => {
                // The secondary copy was written with the same TTL.
                bump(&self.counters.expirations, 1);
                self.lock_index().remove(key);
                self.remove_from_l2(key);
                self.report_memory();
                trace!(key, "cache entry expired");
            }
            Lookup::Miss => {
                if let Some(value) = self.get_from_l2(key) {
                    self.record_hit(started);
                    return Some(value);
                }
            }
        }

        bump(&self.counters.misses, 1);
        if let Some(metrics) = &self.metrics {
            metrics.record_miss(started.elapsed());
        }
        trace!(key, "cache miss");
        None
    }

    /// Looks up `key` in the secondary tier and promotes a hit into L1.
    fn get_from_l2(&self, key: &str) -> Option<V> {
        let tier = self.l2.as_ref()?;
        let bytes = match tier.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.forget_missing_l2(tier, key);
                return None;
            }
            Err(e) => {
                self.record_error(tier.name(), key, &e);
                return None;
            }
        };

        let envelope: Envelope<V> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(source) => {
                let e = CacheError::Corrupt {
                    key: key.to_string(),
                    source,
                };
                self.record_error(tier.name(), key, &e);
                discard_l2(&**tier, &self.index, key);
                return None;
            }
        };

        let now_ms = unix_millis(SystemTime::now());
        let ttl = match envelope.expires_at_ms {
            Some(at) if at <= now_ms => {
                bump(&self.counters.expirations, 1);
                discard_l2(&**tier, &self.index, key);
                trace!(key, tier = tier.name(), "secondary tier entry expired");
                return None;
            }
            Some(at) => Some(Duration::from_millis(at - now_ms)),
            None => None,
        };

        bump(&self.counters.l2_hits, 1);
        debug!(key, tier = tier.name(), "promoting secondary tier hit");
        let value = envelope.value.clone();
        self.insert_l1(key, envelope.value, envelope.tags, ttl, bytes.len(), true);
        Some(value)
    }

    /// Drops the index entry of a key the secondary tier no longer holds,
    /// e.g. because the tier expired or evicted it on its own.
    fn forget_missing_l2(&self, tier: &Arc<dyn CacheTier>, key: &str) {
        if !self.lock_index().in_l2(key) {
            return;
        }
        // A queued write may not have landed yet.
        self.flush_writes();
        if matches!(tier.get(key), Ok(None)) {
            self.lock_index().left_l2(key);
        }
    }

    fn remove_from_l2(&self, key: &str) {
        if let Some(tier) = &self.l2
            && let Err(e) = tier.remove(key)
        {
            self.record_error(tier.name(), key, &e);
        }
    }

    /// Stores `value` under `key`. Returns false if the cache is destroyed or
    /// the value could not be encoded.
    #[instrument(level = Level::TRACE, skip(self, value, options))]
    pub fn set(&self, key: &str, value: V, options: SetOptions) -> bool {
        if self.is_destroyed() {
            return false;
        }

        let ttl = options.ttl.or_else(|| Some(self.settings.default_ttl()));
        let envelope = Envelope {
            value,
            tags: options.tags,
            expires_at_ms: ttl.map(|ttl| unix_millis(SystemTime::now() + ttl)),
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(source) => {
                let e = CacheError::Corrupt {
                    key: key.to_string(),
                    source,
                };
                self.record_error("l1", key, &e);
                return false;
            }
        };

        let write_l2 = self.settings.write_through && self.l2.is_some();
        self.insert_l1(key, envelope.value, envelope.tags, ttl, bytes.len(), write_l2);
        bump(&self.counters.sets, 1);
        if let Some(metrics) = &self.metrics {
            metrics.record_write();
        }

        if self.settings.write_through
            && let Some(tier) = &self.l2
        {
            self.write_l2(tier, key, bytes, ttl);
        }
        true
    }

    /// `in_l2` records that the secondary tier holds the key, or will once
    /// a queued write lands.
    fn insert_l1(
        &self,
        key: &str,
        value: V,
        tags: Vec<String>,
        ttl: Option<Duration>,
        encoded: usize,
        in_l2: bool,
    ) {
        let created_at = Instant::now();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            tags,
            created_at,
            ttl,
            size: encoded + key.len(),
        };

        let expires_at = ttl.map(|ttl| created_at + ttl);
        self.lock_index().insert(key, &entry.tags, expires_at, in_l2);
        let evicted = self.lock_l1().insert(entry);

        if !evicted.is_empty() {
            bump(&self.counters.evictions, evicted.len() as u64);
            let mut index = self.lock_index();
            for entry in &evicted {
                debug!(key = %entry.key, "evicted least recently used entry");
                if let Some(metrics) = &self.metrics {
                    metrics.record_eviction();
                }
                index.left_l1(&entry.key);
            }
        }
        self.report_memory();
    }

    fn write_l2(&self, tier: &Arc<dyn CacheTier>, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) {
        let writer = self.lock_writer();
        if let Some(writer) = writer.as_ref() {
            let op = WriteOp::Set {
                key: key.to_string(),
                bytes,
                ttl,
            };
            if !writer.send(op) {
                let e = CacheError::Unavailable {
                    tier: tier.name().to_string(),
                    message: "writer thread stopped".into(),
                };
                self.record_error(tier.name(), key, &e);
                discard_l2(&**tier, &self.index, key);
            }
            return;
        }
        drop(writer);

        if let Err(e) = tier.set(key, bytes, ttl) {
            self.record_error(tier.name(), key, &e);
            discard_l2(&**tier, &self.index, key);
        }
    }

    /// Removes `key` from every tier. Returns true if it was cached.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn invalidate(&self, key: &str) -> bool {
        self.flush_writes();
        let removed = self.remove_key(key);
        if removed {
            bump(&self.counters.invalidations, 1);
            self.report_memory();
        }
        removed
    }

    /// Removes every entry tagged with any of `tags`. Returns the number of
    /// entries removed.
    #[instrument(level = Level::TRACE, skip(self, tags))]
    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        let keys = self.lock_index().keys_with_any_tag(&tags);
        let removed = self.remove_keys(keys);
        debug!(tags = ?tags, removed, "invalidated by tags");
        removed
    }

    /// Removes every entry whose key starts with `prefix`.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let keys = self.lock_index().keys_matching(|key| key.starts_with(prefix));
        let removed = self.remove_keys(keys);
        debug!(prefix, removed, "invalidated by prefix");
        removed
    }

    /// Removes every entry whose key matches a `*` wildcard pattern, e.g.
    /// `permlint:v1:validation:*`.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let keys = self
            .lock_index()
            .keys_matching(|key| wildcard_matches(pattern, key));
        let removed = self.remove_keys(keys);
        debug!(pattern, removed, "invalidated by pattern");
        removed
    }

    fn remove_keys(&self, keys: impl IntoIterator<Item = String>) -> usize {
        self.flush_writes();
        let removed = keys.into_iter().filter(|key| self.remove_key(key)).count();
        if removed > 0 {
            bump(&self.counters.invalidations, removed as u64);
            self.report_memory();
        }
        removed
    }

    fn remove_key(&self, key: &str) -> bool {
        let mut removed = self.lock_l1().remove(key).is_some();
        self.lock_index().remove(key);
        if let Some(tier) = &self.l2 {
            match tier.remove(key) {
                Ok(found) => removed |= found,
                Err(e) => self.record_error(tier.name(), key, &e),
            }
        }
        removed
    }

    /// Drops expired entries from every tier. Returns how many keys were
    /// dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut keys: HashSet<String> = self
            .lock_l1()
            .purge_expired(now)
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        // Keys evicted from L1 expire in the secondary tier only.
        keys.extend(self.lock_index().expired(now));
        if keys.is_empty() {
            return 0;
        }

        let mut index = self.lock_index();
        for key in &keys {
            index.remove(key);
        }
        drop(index);
        for key in &keys {
            self.lock_l1().remove(key);
            self.remove_from_l2(key);
        }

        bump(&self.counters.expirations, keys.len() as u64);
        self.report_memory();
        debug!(count = keys.len(), "purged expired entries");
        keys.len()
    }

    /// Removes everything from every tier.
    pub fn clear(&self) {
        self.flush_writes();
        self.lock_l1().clear();
        self.lock_index().clear();
        if let Some(tier) = &self.l2
            && let Err(e) = tier.clear()
        {
            self.record_error(tier.name(), "*", &e);
        }
        self.report_memory();
    }

    /// True if `key` is live in the in-process tier. Does not count as a read.
    pub fn contains(&self, key: &str) -> bool {
        self.lock_l1().contains(key, Instant::now())
    }

    /// True if either tier holds `key`, live or not yet purged.
    pub fn holds(&self, key: &str) -> bool {
        self.lock_index().contains(key)
    }

    /// Entries in the in-process tier.
    pub fn len(&self) -> usize {
        self.lock_l1().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_stats(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let hits = load(&self.counters.hits);
        let misses = load(&self.counters.misses);
        let (l1_entries, l1_bytes) = {
            let l1 = self.lock_l1();
            (l1.len(), l1.bytes())
        };
        CacheStats {
            hits,
            misses,
            sets: load(&self.counters.sets),
            evictions: load(&self.counters.evictions),
            invalidations: load(&self.counters.invalidations),
            expirations: load(&self.counters.expirations),
            errors: load(&self.counters.errors),
            l1_entries,
            l1_bytes,
            l2_hits: load(&self.counters.l2_hits),
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
        }
    }

    /// Waits for pending asynchronous secondary-tier writes.
    pub fn flush_writes(&self) {
        if let Some(writer) = self.lock_writer().as_ref() {
            writer.flush();
        }
    }

    /// Stops the writer thread after it drains, and empties the in-process
    /// tier. Later reads miss and later writes are ignored.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let writer = self.lock_writer().take();
        drop(writer);
        self.lock_l1().clear();
        self.lock_index().clear();
        self.report_memory();
        debug!("cache destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn record_hit(&self, started: Instant) {
        bump(&self.counters.hits, 1);
        if let Some(metrics) = &self.metrics {
            metrics.record_hit(started.elapsed());
        }
    }

    fn record_error(&self, tier: &str, key: &str, error: &CacheError) {
        warn!(tier, key, error = %error, "cache tier error, treating as miss");
        bump(&self.counters.errors, 1);
        if let Some(metrics) = &self.metrics {
            metrics.record_error();
        }
    }

    fn report_memory(&self) {
        if let Some(metrics) = &self.metrics {
            let bytes = self.lock_l1().bytes();
            metrics.set_memory_usage(bytes);
        }
    }

    fn lock_l1(&self) -> MutexGuard<'_, LruTier<V>> {
        self.l1.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_index(&self) -> MutexGuard<'_, KeyIndex> {
        lock_index(&self.index)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<Writer>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V> CacheInvalidator for CacheManager<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    fn invalidate_key(&self, key: &str) -> bool {
        self.invalidate(key)
    }

    fn invalidate_tags(&self, tags: &[String]) -> usize {
        self.invalidate_by_tags(tags)
    }

    fn invalidate_prefix(&self, prefix: &str) -> usize {
        CacheManager::invalidate_prefix(self, prefix)
    }

    fn invalidate_pattern(&self, pattern: &str) -> usize {
        CacheManager::invalidate_pattern(self, pattern)
    }

    fn purge_expired(&self) -> usize {
        CacheManager::purge_expired(self)
    }

    fn contains_key(&self, key: &str) -> bool {
        self.holds(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CacheSettings {
        CacheSettings::default()
    }

    fn cache() -> CacheManager<String> {
        CacheManager::new(settings()).unwrap()
    }

    /// A tier that fails every operation.
    struct BrokenTier;

    impl CacheTier for BrokenTier {
        fn name(&self) -> &str {
            "broken"
        }
        fn get(&self, _key: &str) -> std::result::Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Unavailable {
                tier: "broken".into(),
                message: "down".into(),
            })
        }
        fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> std::result::Result<(), CacheError> {
            Err(CacheError::Unavailable {
                tier: "broken".into(),
                message: "down".into(),
            })
        }
        fn remove(&self, _key: &str) -> std::result::Result<bool, CacheError> {
            Ok(false)
        }
        fn clear(&self) -> std::result::Result<(), CacheError> {
            Ok(())
        }
    }

    /// A tier that keeps entries until removed, leaving expiry to the
    /// envelope.
    struct KeepForeverTier(MemoryTier);

    impl CacheTier for KeepForeverTier {
        fn name(&self) -> &str {
            "keep-forever"
        }
        fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, CacheError> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> std::result::Result<(), CacheError> {
            self.0.set(key, value, None)
        }
        fn remove(&self, key: &str) -> std::result::Result<bool, CacheError> {
            self.0.remove(key)
        }
        fn clear(&self) -> std::result::Result<(), CacheError> {
            self.0.clear()
        }
    }

    fn write_through(tier: Arc<dyn CacheTier>, max_entries: usize) -> CacheManager<String> {
        CacheManager::builder(CacheSettings {
            max_entries,
            write_through: true,
            async_write_through: false,
            ..settings()
        })
        .tier(tier)
        .build()
        .unwrap()
    }

    #[test]
    fn test_get_set_and_stats() {
        let cache = cache();
        assert_eq!(cache.get("k"), None);
        assert!(cache.set("k", "v".into(), SetOptions::new()));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.l1_entries, 1);
        assert!(stats.l1_bytes > 0);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_invalidate_by_tags_counts_removed() {
        let cache = cache();
        cache.set("a", "1".into(), SetOptions::new().tag("t1"));
        cache.set("b", "2".into(), SetOptions::new().tags(["t1", "t2"]));
        cache.set("c", "3".into(), SetOptions::new().tag("t3"));

        assert_eq!(cache.invalidate_by_tags(&["t1"]), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c").as_deref(), Some("3"));
        assert_eq!(cache.invalidate_by_tags(&["t1"]), 0);
        assert_eq!(cache.get_stats().invalidations, 2);
    }

    #[test]
    fn test_invalidate_prefix_and_pattern() {
        let cache = cache();
        cache.set("config:a", "1".into(), SetOptions::new());
        cache.set("config:b", "2".into(), SetOptions::new());
        cache.set("validation:a", "3".into(), SetOptions::new());

        assert_eq!(cache.invalidate_pattern("config:*"), 2);
        assert!(cache.contains("validation:a"));
        assert_eq!(cache.invalidate_prefix("validation:"), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_is_counted() {
        let cache: CacheManager<String> = CacheManager::new(CacheSettings {
            max_entries: 2,
            ..settings()
        })
        .unwrap();
        cache.set("a", "1".into(), SetOptions::new());
        cache.set("b", "2".into(), SetOptions::new());
        cache.get("a");
        cache.set("c", "3".into(), SetOptions::new());

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache();
        cache.set("k", "v".into(), SetOptions::new().ttl(Duration::ZERO));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.get_stats().expirations, 1);

        cache.set("short", "v".into(), SetOptions::new().ttl(Duration::ZERO));
        assert_eq!(cache.purge_expired(), 1);
    }

    #[test]
    fn test_write_through_promotes_from_l2() {
        let tier = Arc::new(MemoryTier::new(10));
        let cache: CacheManager<String> = CacheManager::builder(CacheSettings {
            max_entries: 1,
            write_through: true,
            async_write_through: false,
            ..settings()
        })
        .tier(tier.clone())
        .build()
        .unwrap();

        cache.set("a", "1".into(), SetOptions::new().tag("t"));
        cache.set("b", "2".into(), SetOptions::new());
        assert!(!cache.contains("a"));
        assert_eq!(tier.len(), 2);

        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert_eq!(cache.get_stats().l2_hits, 1);
        assert!(cache.contains("a"));

        // Tags survive the round trip through the secondary tier.
        assert_eq!(cache.invalidate_by_tags(&["t"]), 1);
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_rejected_secondary_writes_leave_no_index_entries() {
        let tier = Arc::new(MemoryTier::new(1));
        let cache = write_through(tier.clone(), 1);
        for i in 0..20 {
            cache.set(&format!("k{i}"), i.to_string(), SetOptions::new().tag("t"));
        }

        // k0 filled the secondary tier; k19 is the only key left in L1.
        assert_eq!(tier.len(), 1);
        assert_eq!(cache.lock_index().len(), 2);
        assert!(cache.holds("k0"));
        assert!(cache.holds("k19"));
        assert!(!cache.holds("k5"));
        assert_eq!(cache.get_stats().errors, 19);

        assert_eq!(cache.invalidate_by_tags(&["t"]), 2);
        assert_eq!(cache.lock_index().len(), 0);
    }

    #[test]
    fn test_expired_secondary_hit_is_removed() {
        let inner = Arc::new(KeepForeverTier(MemoryTier::new(10)));
        let cache = write_through(inner.clone(), 1);
        cache.set("a", "1".into(), SetOptions::new().ttl(Duration::from_millis(20)));
        cache.set("b", "2".into(), SetOptions::new());
        assert!(!cache.contains("a"));
        assert!(cache.holds("a"));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get_stats().expirations, 1);
        assert_eq!(inner.0.len(), 1);
        assert!(!cache.holds("a"));
    }

    #[test]
    fn test_purge_reaches_secondary_only_keys() {
        let inner = Arc::new(KeepForeverTier(MemoryTier::new(10)));
        let cache = write_through(inner.clone(), 1);
        cache.set("a", "1".into(), SetOptions::new().ttl(Duration::from_millis(20)).tag("t"));
        cache.set("b", "2".into(), SetOptions::new());

        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(inner.0.len(), 1);
        assert!(!cache.holds("a"));
        assert_eq!(cache.invalidate_by_tags(&["t"]), 0);
    }

    #[test]
    fn test_secondary_tier_dropping_a_key_clears_its_index_entry() {
        let tier = Arc::new(MemoryTier::new(10));
        let cache = write_through(tier.clone(), 1);
        cache.set("a", "1".into(), SetOptions::new());
        cache.set("b", "2".into(), SetOptions::new());
        tier.remove("a").unwrap();

        assert_eq!(cache.get("a"), None);
        assert!(!cache.holds("a"));
        assert!(cache.holds("b"));
    }

    #[test]
    fn test_async_write_through() {
        let tier = Arc::new(MemoryTier::new(10));
        let cache: CacheManager<String> = CacheManager::builder(CacheSettings {
            write_through: true,
            async_write_through: true,
            ..settings()
        })
        .tier(tier.clone())
        .build()
        .unwrap();

        cache.set("a", "1".into(), SetOptions::new());
        cache.flush_writes();
        assert_eq!(tier.len(), 1);

        assert!(cache.invalidate("a"));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_tier_failure_degrades_to_miss() {
        let metrics = Arc::new(MetricsCollector::default());
        let cache: CacheManager<String> = CacheManager::builder(CacheSettings {
            write_through: true,
            async_write_through: false,
            ..settings()
        })
        .tier(Arc::new(BrokenTier))
        .metrics(metrics.clone())
        .build()
        .unwrap();

        assert!(cache.set("a", "1".into(), SetOptions::new()));
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert_eq!(cache.get("missing"), None);

        // One failed write, one failed read.
        assert_eq!(cache.get_stats().errors, 2);
        assert_eq!(metrics.get_stats().errors, 2);
    }

    #[test]
    fn test_metrics_receive_hits_and_misses() {
        let metrics = Arc::new(MetricsCollector::default());
        let cache: CacheManager<String> = CacheManager::builder(settings())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        cache.get("x");
        cache.set("x", "1".into(), SetOptions::new());
        cache.get("x");

        let stats = metrics.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert!(metrics.get_metrics().memory_bytes > 0);
    }

    #[test]
    fn test_destroy() {
        let cache = cache();
        cache.set("a", "1".into(), SetOptions::new());
        cache.destroy();
        assert!(cache.is_destroyed());
        assert_eq!(cache.get("a"), None);
        assert!(!cache.set("b", "2".into(), SetOptions::new()));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_clear() {
        let cache = cache();
        cache.set("a", "1".into(), SetOptions::new().tag("t"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.invalidate_by_tags(&["t"]), 0);
    }
}
