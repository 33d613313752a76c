//! Entry staging policy
//!
//! The entry factory decides how a key's current state is materialized into
//! an invocation's working set. Staging is idempotent: a key already present
//! in the working set is never fetched from the store again.

use crate::context::InvocationContext;
use crate::error::{CacheError, Result};
use crate::storage::container::DataContainer;
use crate::storage::entry::StagedEntry;
use crate::storage::lock::LockManager;
use crate::types::Key;
use std::sync::Arc;
use std::time::Duration;

/// What a write intends to do with the staged entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    /// Single-key put; `overwrite` is false for put-if-absent
    Put { overwrite: bool },
    /// Bulk put, always overwriting
    PutAll,
    Remove,
    /// Requires the key to exist
    Replace,
    Clear,
    /// No read-through; keys absent from the store are skipped
    Invalidate,
}

/// Builds staged entries in an invocation's working set
pub trait EntryFactory: Send + Sync {
    /// Stage a key for reading
    fn wrap_entry_for_reading(&self, ctx: &mut InvocationContext, key: &Key) -> Result<()>;

    /// Stage a key for writing under the given intent
    ///
    /// Fails with [`CacheError::LockTimeout`] when a lock the intent needs
    /// cannot be taken in time, and with [`CacheError::StagingFailure`] when
    /// the intent's preconditions do not hold.
    fn wrap_entry_for_writing(
        &self,
        ctx: &mut InvocationContext,
        key: &Key,
        intent: WriteIntent,
    ) -> Result<()>;

    fn wrap_entry_for_put(
        &self,
        ctx: &mut InvocationContext,
        key: &Key,
        overwrite: bool,
    ) -> Result<()> {
        self.wrap_entry_for_writing(ctx, key, WriteIntent::Put { overwrite })
    }

    fn wrap_entry_for_remove(&self, ctx: &mut InvocationContext, key: &Key) -> Result<()> {
        self.wrap_entry_for_writing(ctx, key, WriteIntent::Remove)
    }

    fn wrap_entry_for_replace(&self, ctx: &mut InvocationContext, key: &Key) -> Result<()> {
        self.wrap_entry_for_writing(ctx, key, WriteIntent::Replace)
    }

    fn wrap_entry_for_clear(&self, ctx: &mut InvocationContext, key: &Key) -> Result<()> {
        self.wrap_entry_for_writing(ctx, key, WriteIntent::Clear)
    }
}

/// Stages copies of container entries
///
/// Invalidation staging locks the key for the invocation, since
/// invalidations do not pass through the up-front locking of ordinary
/// writes.
pub struct DefaultEntryFactory {
    container: Arc<dyn DataContainer>,
    lock_manager: Arc<LockManager>,
    lock_acquisition_timeout: Duration,
}

impl DefaultEntryFactory {
    pub fn new(
        container: Arc<dyn DataContainer>,
        lock_manager: Arc<LockManager>,
        lock_acquisition_timeout: Duration,
    ) -> Self {
        Self {
            container,
            lock_manager,
            lock_acquisition_timeout,
        }
    }
}

impl EntryFactory for DefaultEntryFactory {
    fn wrap_entry_for_reading(&self, ctx: &mut InvocationContext, key: &Key) -> Result<()> {
        if ctx.is_staged(key) {
            return Ok(());
        }

        let entry = match self.container.get(key) {
            Some(stored) => StagedEntry::from_stored(&stored),
            None => StagedEntry::absent(key.clone()),
        };
        tracing::trace!(%key, exists = entry.exists(), "staged entry for reading");
        ctx.put_lookup_entry(entry);
        Ok(())
    }

    fn wrap_entry_for_writing(
        &self,
        ctx: &mut InvocationContext,
        key: &Key,
        intent: WriteIntent,
    ) -> Result<()> {
        if let Some(entry) = ctx.lookup_entry_mut(key) {
            // A removal staged earlier in this invocation is undone by an
            // overwriting put
            if matches!(intent, WriteIntent::Put { overwrite: true } | WriteIntent::PutAll) {
                entry.undelete();
            }
            return Ok(());
        }

        let entry = match (intent, self.container.get(key)) {
            (WriteIntent::Invalidate, None) => {
                tracing::trace!(%key, "key not in store, nothing to invalidate");
                return Ok(());
            }
            (WriteIntent::Invalidate, Some(stored)) => {
                self.lock_manager
                    .acquire_for(ctx, key, self.lock_acquisition_timeout)?;
                StagedEntry::from_stored(&stored)
            }
            (WriteIntent::Replace, None) => {
                return Err(CacheError::StagingFailure {
                    key: key.clone(),
                    reason: "replace requires an existing entry".to_string(),
                });
            }
            (_, Some(stored)) => StagedEntry::from_stored(&stored),
            (_, None) => StagedEntry::absent(key.clone()),
        };

        tracing::trace!(%key, ?intent, "staged entry for writing");
        ctx.put_lookup_entry(entry);
        Ok(())
    }
}
