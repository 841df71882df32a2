//! Capacity-bounded store for tiles that left the active set.
//!
//! Evicted tiles with data are parked here so that panning or zooming back
//! can reuse them without a refetch. Entries are kept in global insertion
//! order; several entries may share a key and are handed out FIFO.
//!
//! # Eviction
//!
//! An entry leaves the store in one of two ways:
//!
//! - handed back to the caller by [`BoundedTileStore::get_and_remove`], with
//!   no callback
//! - evicted (capacity, explicit removal, expiry, filter or reset), in which
//!   case the eviction callback receives the value exactly once

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

use crate::tile::TileKey;

/// Callback receiving every evicted value.
pub type EvictFn<V> = Box<dyn FnMut(V) + Send>;

struct StoreEntry<V> {
    key: TileKey,
    value: V,
    expires_at: Option<Instant>,
}

/// FIFO-per-key store bounded by entry count.
///
/// # Example
///
/// ```
/// use tile_pyramid::cache::BoundedTileStore;
/// use tile_pyramid::tile::TileKey;
///
/// let mut store = BoundedTileStore::new(2, Box::new(|_evicted: u32| {}));
/// let key = TileKey::new(0, 1, 1, 0, 0);
/// store.add(key, 1, None);
/// store.add(key, 2, None);
/// assert_eq!(store.get_and_remove(key), Some(1));
/// assert_eq!(store.get_and_remove(key), Some(2));
/// ```
pub struct BoundedTileStore<V> {
    /// All entries by insertion sequence number; LRU end is the oldest
    entries: LruCache<u64, StoreEntry<V>>,
    /// Sequence numbers per key, oldest first
    order: HashMap<TileKey, VecDeque<u64>>,
    next_seq: u64,
    max_size: usize,
    on_evict: EvictFn<V>,
}

impl<V> BoundedTileStore<V> {
    /// Create a store holding at most `max_size` entries.
    pub fn new(max_size: usize, on_evict: EvictFn<V>) -> Self {
        Self {
            entries: LruCache::unbounded(),
            order: HashMap::new(),
            next_seq: 0,
            max_size,
            on_evict,
        }
    }

    /// Append `value` under `key`, evicting the oldest entries if over capacity.
    ///
    /// With `expiry`, the entry becomes eligible for [`prune_expired`] once
    /// that much time has passed.
    ///
    /// [`prune_expired`]: BoundedTileStore::prune_expired
    pub fn add(&mut self, key: TileKey, value: V, expiry: Option<Duration>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let expires_at = expiry.map(|delay| Instant::now() + delay);
        self.entries.push(
            seq,
            StoreEntry {
                key,
                value,
                expires_at,
            },
        );
        self.order.entry(key).or_default().push_back(seq);

        self.shrink_to(self.max_size);
    }

    /// Oldest value stored under `key`, without removing it.
    pub fn get(&self, key: TileKey) -> Option<&V> {
        let seq = self.order.get(&key)?.front()?;
        self.entries.peek(seq).map(|entry| &entry.value)
    }

    /// Remove and return the oldest value under `key`. The eviction callback
    /// is not invoked.
    pub fn get_and_remove(&mut self, key: TileKey) -> Option<V> {
        let seq = self.pop_front_seq(key)?;
        self.entries.pop(&seq).map(|entry| entry.value)
    }

    pub fn has(&self, key: TileKey) -> bool {
        self.order.contains_key(&key)
    }

    /// Evict the oldest entry under `key`. Returns whether one existed.
    pub fn remove(&mut self, key: TileKey) -> bool {
        match self.get_and_remove(key) {
            Some(value) => {
                debug!(key = %key, "Tile store entry removed");
                (self.on_evict)(value);
                true
            }
            None => false,
        }
    }

    /// Evict every entry.
    pub fn reset(&mut self) {
        self.shrink_to(0);
    }

    /// Change the capacity, evicting the oldest entries if now over it.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.shrink_to(max_size);
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Evict every entry for which `keep` returns false.
    pub fn filter<F>(&mut self, mut keep: F)
    where
        F: FnMut(&V) -> bool,
    {
        let doomed: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| !keep(&entry.value))
            .map(|(seq, _)| *seq)
            .collect();

        for seq in doomed {
            self.evict_seq(seq);
        }
    }

    /// Evict entries whose expiry deadline is at or before `now`.
    ///
    /// Returns the number of evicted entries.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let doomed: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(seq, _)| *seq)
            .collect();

        let count = doomed.len();
        for seq in doomed {
            self.evict_seq(seq);
        }
        if count > 0 {
            debug!(count, "Expired tile store entries evicted");
        }
        count
    }

    /// Earliest pending expiry deadline.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|(_, entry)| entry.expires_at)
            .min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct keys currently stored.
    pub fn keys(&self) -> Vec<TileKey> {
        self.order.keys().copied().collect()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn shrink_to(&mut self, max_size: usize) {
        while self.entries.len() > max_size {
            let Some((seq, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.forget_seq(entry.key, seq);
            debug!(key = %entry.key, "Tile store entry evicted for capacity");
            (self.on_evict)(entry.value);
        }
    }

    fn evict_seq(&mut self, seq: u64) {
        if let Some(entry) = self.entries.pop(&seq) {
            self.forget_seq(entry.key, seq);
            (self.on_evict)(entry.value);
        }
    }

    fn pop_front_seq(&mut self, key: TileKey) -> Option<u64> {
        let queue = self.order.get_mut(&key)?;
        let seq = queue.pop_front();
        if queue.is_empty() {
            self.order.remove(&key);
        }
        seq
    }

    fn forget_seq(&mut self, key: TileKey, seq: u64) {
        if let Some(queue) = self.order.get_mut(&key) {
            queue.retain(|s| *s != seq);
            if queue.is_empty() {
                self.order.remove(&key);
            }
        }
    }
}

impl<V> fmt::Debug for BoundedTileStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTileStore")
            .field("len", &self.entries.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
