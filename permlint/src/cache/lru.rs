//! The in-process cache tier: a bounded LRU map.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub tags: Vec<String>,
    pub created_at: Instant,
    /// `None` never expires.
    pub ttl: Option<Duration>,
    /// Approximate size in bytes (encoded value plus key).
    pub size: usize,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.created_at) >= ttl)
    }

    /// Time left before expiry, `None` if the entry never expires.
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.ttl
            .map(|ttl| ttl.saturating_sub(now.saturating_duration_since(self.created_at)))
    }
}

/// Outcome of an LRU lookup.
#[derive(Debug)]
pub enum Lookup<V> {
    Hit(V),
    /// The entry existed but had expired; it has been removed.
    Expired(CacheEntry<V>),
    Miss,
}

struct Slot<V> {
    entry: CacheEntry<V>,
    tick: u64,
}

/// LRU map bounded by entry count and, optionally, total bytes.
///
/// Recency is tracked with a monotonically increasing tick per access; the
/// smallest tick is the least recently used entry.
pub struct LruTier<V> {
    slots: HashMap<String, Slot<V>>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    max_entries: usize,
    max_bytes: Option<usize>,
    bytes: usize,
}

impl<V: Clone> LruTier<V> {
    pub fn new(max_entries: usize, max_bytes: Option<usize>) -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            max_entries: max_entries.max(1),
            max_bytes,
            bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Looks up `key`, marking it most recently used on a hit.
    pub fn get(&mut self, key: &str, now: Instant) -> Lookup<V> {
        let Some(slot) = self.slots.get(key) else {
            return Lookup::Miss;
        };
        if slot.entry.is_expired(now) {
            return match self.remove(key) {
                Some(entry) => Lookup::Expired(entry),
                None => Lookup::Miss,
            };
        }

        let tick = self.bump();
        let Some(slot) = self.slots.get_mut(key) else {
            return Lookup::Miss;
        };
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.to_string());
        Lookup::Hit(slot.entry.value.clone())
    }

    /// Returns true if a live entry exists, without touching recency.
    pub fn contains(&self, key: &str, now: Instant) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired(now))
    }

    /// Inserts or replaces an entry. Returns the entries evicted to stay
    /// within bounds, least recently used first.
    pub fn insert(&mut self, entry: CacheEntry<V>) -> Vec<CacheEntry<V>> {
        let key = entry.key.clone();
        self.remove(&key);

        let tick = self.bump();
        self.bytes += entry.size;
        self.order.insert(tick, key.clone());
        self.slots.insert(key, Slot { entry, tick });

        let mut evicted = Vec::new();
        while self.over_budget() {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&oldest) {
                self.bytes -= slot.entry.size;
                evicted.push(slot.entry);
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        self.bytes -= slot.entry.size;
        Some(slot.entry)
    }

    /// Removes and returns every expired entry.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<CacheEntry<V>> {
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        expired.iter().filter_map(|key| self.remove(key)).collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.slots.keys()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
        self.bytes = 0;
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn over_budget(&self) -> bool {
        self.slots.len() > self.max_entries || self.max_bytes.is_some_and(|max| self.bytes > max)
    }
}
