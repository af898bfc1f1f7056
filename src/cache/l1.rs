//! L1 Cache - In-Memory LRU Tier
//!
//! Bounded, cost-aware LRU. Capacity is either an entry count or an aggregate
//! cost computed by a pluggable cost function (e.g. byte length).
//!
//! # Design
//!
//! - Hash index into an arena of nodes linked by slot indices
//! - Most-recently-used at the head, least-recently-used at the tail
//! - One mutex guards index, arena and list; every operation is O(1)
//!   except eviction, which is O(k) in the number of evicted entries
//! - Eviction listeners run after the lock is released

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::entry::CacheEntry;

/// Cost function for cost-aware tiers
pub type CostFn<V> = Box<dyn Fn(&V) -> u64 + Send + Sync>;

/// Listener invoked once per entry dropped by the tier itself
pub type EvictionListener<V> = Box<dyn Fn(&str, &CacheEntry<V>, RemovalCause) + Send + Sync>;

/// Why the tier dropped an entry on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Least-recently-used entry pushed out by a put
    Capacity,
    /// TTL elapsed, discovered on access
    Expired,
}

struct Node<V> {
    key: String,
    entry: CacheEntry<V>,
    cost: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena-backed recency list
struct LruList<V> {
    index: HashMap<String, usize>,
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total_cost: u64,
}

impl<V> LruList<V> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            total_cost: 0,
        }
    }

    fn slot(&self, idx: usize) -> Option<&Node<V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Node<V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slot_mut(idx) {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };
        match prev.and_then(|p| self.slot_mut(p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.slot_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.slot_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head.and_then(|h| self.slot_mut(h)) {
            Some(h) => h.prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    /// Insert at the MRU end, returning the replaced node if any
    fn insert(&mut self, key: String, entry: CacheEntry<V>, cost: u64) -> Option<Node<V>> {
        let replaced = self.remove(&key);
        let node = Node {
            key: key.clone(),
            entry,
            cost,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        self.total_cost += cost;
        replaced
    }

    fn remove(&mut self, key: &str) -> Option<Node<V>> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.total_cost = self.total_cost.saturating_sub(node.cost);
        Some(node)
    }

    fn pop_lru(&mut self) -> Option<Node<V>> {
        let idx = self.tail?;
        let key = self.slot(idx)?.key.clone();
        self.remove(&key)
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// L1 Cache - bounded in-memory LRU tier
pub struct MemoryTier<V> {
    state: Mutex<LruList<V>>,
    /// Maximum aggregate cost
    capacity: u64,
    cost_fn: CostFn<V>,
    listener: Option<EvictionListener<V>>,
    evictions: AtomicU64,
}

impl<V: Clone> MemoryTier<V> {
    /// Create a tier bounded by entry count
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self::with_max_cost(max_entries as u64, |_| 1)
    }

    /// Create a tier bounded by aggregate cost
    pub fn with_max_cost(
        max_cost: u64,
        cost_fn: impl Fn(&V) -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(LruList::new()),
            capacity: max_cost,
            cost_fn: Box::new(cost_fn),
            listener: None,
            evictions: AtomicU64::new(0),
        }
    }

    /// Attach an eviction listener
    pub fn on_eviction(
        mut self,
        listener: impl Fn(&str, &CacheEntry<V>, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Get an entry, marking it most-recently-used and recording the access.
    ///
    /// Returns a copy carrying the updated metadata. Expired entries are
    /// dropped and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let idx = *state.index.get(key)?;

        let expired = state
            .slot(idx)
            .map_or(true, |node| node.entry.metadata.is_expired_at(now));
        if expired {
            let removed = state.remove(key);
            drop(state);
            if let Some(node) = removed {
                debug!(key = %node.key, "L1 entry expired");
                self.notify(&node.key, &node.entry, RemovalCause::Expired);
            }
            return None;
        }

        state.move_to_front(idx);
        let node = state.slot_mut(idx)?;
        node.entry.metadata.record_access(now);
        Some(node.entry.clone())
    }

    /// Put a value with fresh metadata
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) -> bool {
        self.insert_entry(key, CacheEntry::new(value, ttl))
    }

    /// Insert an entry as-is, keeping its metadata (tier promotion).
    ///
    /// Returns false if the entry alone exceeds the tier capacity; any previous
    /// value under the key is dropped in that case.
    pub fn insert_entry(&self, key: impl Into<String>, entry: CacheEntry<V>) -> bool {
        let key = key.into();
        let cost = (self.cost_fn)(&entry.value);

        if cost > self.capacity {
            debug!(key = %key, cost, capacity = self.capacity, "L1 rejected oversized entry");
            self.state.lock().remove(&key);
            return false;
        }

        let evicted = {
            let mut state = self.state.lock();
            state.insert(key, entry, cost);

            let mut evicted = Vec::new();
            while state.total_cost > self.capacity {
                match state.pop_lru() {
                    Some(node) => evicted.push(node),
                    None => break,
                }
            }
            evicted
        };

        for node in evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %node.key, "L1 evicted least-recently-used entry");
            self.notify(&node.key, &node.entry, RemovalCause::Capacity);
        }
        true
    }

    /// Remove an entry from the cache
    pub fn remove(&self, key: &str) -> Option<CacheEntry<V>> {
        self.state.lock().remove(key).map(|node| node.entry)
    }

    /// Check if cache contains a key (no recency update)
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().index.contains_key(key)
    }

    /// Snapshot of the keys currently held
    pub fn keys(&self) -> HashSet<String> {
        self.state.lock().index.keys().cloned().collect()
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Current aggregate cost (entry count for count-bounded tiers)
    pub fn size(&self) -> u64 {
        self.state.lock().total_cost
    }

    /// Get capacity
    pub fn max_capacity(&self) -> u64 {
        self.capacity
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn notify(&self, key: &str, entry: &CacheEntry<V>, cause: RemovalCause) {
        if let Some(listener) = &self.listener {
            listener(key, entry, cause);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
