//! Authoritative in-memory data container

use crate::error::Result;
use crate::storage::entry::StoredEntry;
use crate::types::{Key, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store holding the authoritative value of every key on this node
///
/// Implementations must be safe to call concurrently for distinct keys.
pub trait DataContainer: Send + Sync {
    fn get(&self, key: &Key) -> Option<StoredEntry>;

    fn put(&self, key: Key, value: Value) -> Result<()>;

    fn remove(&self, key: &Key) -> Result<Option<StoredEntry>>;

    /// Snapshot of the keys currently stored
    fn keys(&self) -> Vec<Key>;

    /// Snapshot of the entries currently stored
    fn entries(&self) -> Vec<StoredEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains_key(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }
}

/// Hash-map backed container
pub struct InMemoryDataContainer {
    entries: RwLock<HashMap<Key, StoredEntry>>,
    next_version: AtomicU64,
}

impl InMemoryDataContainer {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryDataContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataContainer for InMemoryDataContainer {
    fn get(&self, key: &Key) -> Option<StoredEntry> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let entry = StoredEntry::new(key.clone(), value, version);
        self.entries.write().insert(key, entry);
        Ok(())
    }

    fn remove(&self, key: &Key) -> Result<Option<StoredEntry>> {
        Ok(self.entries.write().remove(key))
    }

    fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.entries.read().keys().cloned().collect();
        keys.sort(); // Sort for deterministic iteration
        keys
    }

    fn entries(&self) -> Vec<StoredEntry> {
        let mut entries: Vec<StoredEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
