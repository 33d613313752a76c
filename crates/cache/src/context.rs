//! Per-invocation context
//!
//! Every command runs against exactly one [`InvocationContext`]. It carries
//! the working set of staged entries, the flags that tune how the chain
//! treats the invocation, and the lock tokens the invocation currently holds.
//! Contexts are never shared between invocations.

use crate::storage::entry::StagedEntry;
use crate::storage::lock::LockOwner;
use crate::types::{Key, TransactionId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Flags altering how the chain handles an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Commit entries even when this node does not own the key
    SkipOwnershipCheck,
    /// Fail lock acquisition immediately instead of waiting
    ZeroLockAcquisitionTimeout,
}

/// Insertion-ordered staging area for one invocation
///
/// Backed by a vector so reverse iteration follows staging order exactly,
/// with a side index for lookups by key.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    entries: Vec<StagedEntry>,
    index: HashMap<Key, usize>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an entry unless its key is already present
    ///
    /// Returns `true` if the entry was inserted.
    pub fn insert(&mut self, entry: StagedEntry) -> bool {
        if self.index.contains_key(entry.key()) {
            return false;
        }
        self.index.insert(entry.key().clone(), self.entries.len());
        self.entries.push(entry);
        true
    }

    pub fn get(&self, key: &Key) -> Option<&StagedEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut StagedEntry> {
        match self.index.get(key) {
            Some(&i) => Some(&mut self.entries[i]),
            None => None,
        }
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in staging order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &StagedEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut StagedEntry> {
        self.entries.iter_mut()
    }

    /// Drop every staged entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

/// State carried by one invocation through the interceptor chain
#[derive(Debug)]
pub struct InvocationContext {
    owner: LockOwner,
    origin_local: bool,
    gtx: Option<TransactionId>,
    flags: HashSet<Flag>,
    lock_timeout: Option<Duration>,
    entries: WorkingSet,
    /// Keys locked by this invocation, in acquisition order
    locked_keys: Vec<Key>,
}

impl InvocationContext {
    /// Context for a single non-transactional command issued on this node
    pub fn non_transactional(owner: LockOwner) -> Self {
        Self::new(owner, true, None)
    }

    /// Context for a transaction started on this node
    pub fn local_transaction(owner: LockOwner, gtx: TransactionId) -> Self {
        Self::new(owner, true, Some(gtx))
    }

    /// Context replaying a transaction started on another node
    pub fn remote_transaction(owner: LockOwner, gtx: TransactionId) -> Self {
        Self::new(owner, false, Some(gtx))
    }

    fn new(owner: LockOwner, origin_local: bool, gtx: Option<TransactionId>) -> Self {
        Self {
            owner,
            origin_local,
            gtx,
            flags: HashSet::new(),
            lock_timeout: None,
            entries: WorkingSet::new(),
            locked_keys: Vec::new(),
        }
    }

    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// Whether the invocation was issued on this node
    pub fn is_origin_local(&self) -> bool {
        self.origin_local
    }

    pub fn is_in_transaction(&self) -> bool {
        self.gtx.is_some()
    }

    pub fn gtx(&self) -> Option<TransactionId> {
        self.gtx
    }

    pub fn set_flag(&mut self, flag: Flag) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: Flag) {
        self.flags.remove(&flag);
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Run `body` with `flag` set, restoring the previous flag state after
    ///
    /// A flag the invocation already carried stays set.
    pub fn with_flag<T>(&mut self, flag: Flag, body: impl FnOnce(&mut Self) -> T) -> T {
        let newly_set = self.flags.insert(flag);
        let result = body(self);
        if newly_set {
            self.clear_flag(flag);
        }
        result
    }

    /// Override the configured lock acquisition timeout
    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = Some(timeout);
    }

    /// Effective lock acquisition timeout for this invocation
    pub fn lock_timeout(&self, default: Duration) -> Duration {
        if self.has_flag(Flag::ZeroLockAcquisitionTimeout) {
            Duration::ZERO
        } else {
            self.lock_timeout.unwrap_or(default)
        }
    }

    pub fn lookup_entry(&self, key: &Key) -> Option<&StagedEntry> {
        self.entries.get(key)
    }

    pub fn lookup_entry_mut(&mut self, key: &Key) -> Option<&mut StagedEntry> {
        self.entries.get_mut(key)
    }

    pub fn is_staged(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Stage an entry; a key already staged is left untouched
    pub fn put_lookup_entry(&mut self, entry: StagedEntry) -> bool {
        self.entries.insert(entry)
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.entries
    }

    pub fn working_set_mut(&mut self) -> &mut WorkingSet {
        &mut self.entries
    }

    /// Drop the working set without committing it
    pub fn discard_entries(&mut self) {
        if !self.entries.is_empty() {
            tracing::trace!(owner = %self.owner, entries = self.entries.len(), "discarding working set");
        }
        self.entries.clear();
    }

    /// Record a lock granted to this invocation
    pub fn add_locked_key(&mut self, key: Key) {
        if !self.locked_keys.contains(&key) {
            self.locked_keys.push(key);
        }
    }

    pub fn locked_keys(&self) -> &[Key] {
        &self.locked_keys
    }

    pub fn has_locked_key(&self, key: &Key) -> bool {
        self.locked_keys.contains(key)
    }

    /// Drop the token for `key`, returning whether one was held
    pub fn remove_locked_key(&mut self, key: &Key) -> bool {
        let before = self.locked_keys.len();
        self.locked_keys.retain(|locked| locked != key);
        self.locked_keys.len() != before
    }

    /// Hand over every lock token, leaving none behind
    pub fn take_locked_keys(&mut self) -> Vec<Key> {
        std::mem::take(&mut self.locked_keys)
    }
}
