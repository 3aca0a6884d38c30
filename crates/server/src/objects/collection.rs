//! Keyed concurrent store.
//!
//! Holds connections, players and spores under numeric keys. Values are cloned
//! out of the store (they are handles or `Arc`s), so no lock is held while a
//! caller works with an entry and a panicking callback cannot wedge the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Concurrent map from key to value with store-allocated keys.
#[derive(Debug)]
pub struct SharedCollection<V> {
    entries: RwLock<HashMap<u64, V>>,
    next_id: AtomicU64,
}

impl<V: Clone> SharedCollection<V> {
    /// Create an empty collection. Allocated keys start at 1.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            next_id: AtomicU64::new(1),
        }
    }

    // A panic elsewhere while holding the lock leaves the map itself intact.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, V>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, V>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `value` under a freshly allocated key and return the key.
    pub fn add(&self, value: V) -> u64 {
        let mut entries = self.write();
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Skip keys that were claimed explicitly through `insert`.
        while entries.contains_key(&id) {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        entries.insert(id, value);
        id
    }

    /// Insert `value` under a key owned elsewhere (e.g. a player under its connection id).
    ///
    /// Returns the value previously stored under `id`, if any.
    pub fn insert(&self, id: u64, value: V) -> Option<V> {
        self.write().insert(id, value)
    }

    /// Remove the entry for `id`. Returns `false` if there was none.
    pub fn remove(&self, id: u64) -> bool {
        self.write().remove(&id).is_some()
    }

    /// Get a clone of the value stored under `id`.
    pub fn get(&self, id: u64) -> Option<V> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Vec<(u64, V)> {
        self.read()
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect()
    }

    /// Call `f` for every entry present when the call started.
    ///
    /// The callback runs without the lock held, so it may freely add to or
    /// remove from this collection. Each entry is visited exactly once.
    pub fn for_each(&self, mut f: impl FnMut(u64, &V)) {
        for (id, value) in self.snapshot() {
            f(id, &value);
        }
    }
}

impl<V: Clone> Default for SharedCollection<V> {
    fn default() -> Self {
        Self::new()
    }
}
