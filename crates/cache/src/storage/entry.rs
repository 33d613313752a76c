//! Stored and staged entries

use crate::types::{Key, Value};

/// Authoritative entry held by the data container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: Key,
    pub value: Value,
    /// Bumped on every write to the key
    pub version: u64,
}

impl StoredEntry {
    pub fn new(key: Key, value: Value, version: u64) -> Self {
        Self {
            key,
            value,
            version,
        }
    }
}

/// Working-set copy of an entry, private to one invocation
///
/// Downstream stages mutate it through [`StagedEntry::set_value`] and
/// [`StagedEntry::mark_removed`]; only entries flagged `changed` are ever
/// written back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    key: Key,
    value: Option<Value>,
    /// Version of the stored entry this copy was taken from
    version: Option<u64>,
    changed: bool,
    removed: bool,
    created: bool,
}

impl StagedEntry {
    /// Stage a copy of a stored entry
    pub fn from_stored(stored: &StoredEntry) -> Self {
        Self {
            key: stored.key.clone(),
            value: Some(stored.value.clone()),
            version: Some(stored.version),
            changed: false,
            removed: false,
            created: false,
        }
    }

    /// Stage a placeholder for a key the store does not hold
    pub fn absent(key: Key) -> Self {
        Self {
            key,
            value: None,
            version: None,
            changed: false,
            removed: false,
            created: true,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Current value as seen by this invocation
    pub fn value(&self) -> Option<&Value> {
        if self.removed {
            None
        } else {
            self.value.as_ref()
        }
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Whether the key was absent from the store when staged
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Whether the entry currently holds a live value
    pub fn exists(&self) -> bool {
        self.value().is_some()
    }

    /// Write a new value, returning the previous one
    pub fn set_value(&mut self, value: Value) -> Option<Value> {
        let previous = self.value().cloned();
        self.value = Some(value);
        self.removed = false;
        self.changed = true;
        previous
    }

    /// Mark the entry for removal, returning the previous value
    pub fn mark_removed(&mut self) -> Option<Value> {
        let previous = self.value().cloned();
        self.removed = true;
        self.changed = true;
        previous
    }

    /// Undo a removal staged earlier in the same invocation
    pub fn undelete(&mut self) {
        if self.removed {
            self.removed = false;
            self.value = None;
        }
    }
}
