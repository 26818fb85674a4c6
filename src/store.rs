//! Local multi-value data store.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;

use crate::identifier::{Key, NodeId};
use crate::protocol::DataEntry;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Entries held locally, keyed by data key and then by storer id.
///
/// Keys are kept in an LRU so the store stays bounded; eviction removes every
/// entry under the least recently used key. Deleted entries stay as
/// tombstones until their TTL runs out.
pub struct LocalDataStore {
    entries: LruCache<Key, HashMap<NodeId, DataEntry>>,
}

impl LocalDataStore {
    pub fn new(max_keys: usize) -> Self {
        let cap = NonZeroUsize::new(max_keys.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
        }
    }

    /// Insert an entry unless a same-or-newer one from the same storer exists.
    ///
    /// Returns `true` if the entry was written.
    pub fn store_entry(&mut self, entry: DataEntry) -> bool {
        let storer = entry.storer.node_id;
        if let Some(by_storer) = self.entries.get_mut(&entry.key) {
            if let Some(existing) = by_storer.get(&storer) {
                if existing.storer_time >= entry.storer_time {
                    return false;
                }
            }
            by_storer.insert(storer, entry);
            return true;
        }
        let mut by_storer = HashMap::new();
        let key = entry.key;
        by_storer.insert(storer, entry);
        self.entries.put(key, by_storer);
        true
    }

    /// Unexpired entries under `key`, tombstones included.
    pub fn get_entries(&mut self, key: &Key, now_ms: u64) -> Vec<DataEntry> {
        match self.entries.get(key) {
            Some(by_storer) => by_storer
                .values()
                .filter(|e| !e.is_expired(now_ms))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tombstone the entry `storer` holds under `key`.
    ///
    /// Returns `true` if such an entry exists (already deleted or not).
    pub fn mark_as_deleted(&mut self, key: &Key, storer: &NodeId) -> bool {
        match self.entries.get_mut(key).and_then(|m| m.get_mut(storer)) {
            Some(entry) => {
                entry.deleted = true;
                true
            }
            None => false,
        }
    }

    pub fn set_stale(&mut self, key: &Key, storer: &NodeId, stale: bool) {
        if let Some(entry) = self.entries.peek_mut(key).and_then(|m| m.get_mut(storer)) {
            entry.stale = stale;
        }
    }

    pub fn set_all_stale(&mut self, key: &Key, stale: bool) {
        if let Some(by_storer) = self.entries.peek_mut(key) {
            for entry in by_storer.values_mut() {
                entry.stale = stale;
            }
        }
    }

    /// Physically remove one storer's entry.
    pub fn delete_entry(&mut self, key: &Key, storer: &NodeId) -> Option<DataEntry> {
        let by_storer = self.entries.peek_mut(key)?;
        let removed = by_storer.remove(storer);
        if by_storer.is_empty() {
            self.entries.pop(key);
        }
        removed
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let mut expired = Vec::new();
        for (key, by_storer) in self.entries.iter() {
            for (storer, entry) in by_storer {
                if entry.is_expired(now_ms) {
                    expired.push((*key, *storer));
                }
            }
        }
        for (key, storer) in &expired {
            self.delete_entry(key, storer);
        }
        expired.len()
    }

    /// Copy of every entry, without touching LRU order.
    pub fn snapshot(&self) -> Vec<DataEntry> {
        self.entries
            .iter()
            .flat_map(|(_, by_storer)| by_storer.values().cloned())
            .collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
