//! Locking stage
//!
//! Serializes concurrent writes to the same key. Non-transactional writes
//! lock their keys, run the rest of the chain, commit the working set and
//! release the locks. Transactional writes keep their locks until the
//! transaction completes.
//!
//! Release is scoped: `LockingInterceptor::with_lock_scope` drains the
//! invocation's lock tokens after its body returns, on every path.

use super::{Interceptor, Next, commit_context_entries};
use crate::clustering::ClusteringDependentLogic;
use crate::context::{Flag, InvocationContext};
use crate::error::Result;
use crate::storage::lock::LockManager;
use crate::types::{Command, CommandResult, Key};
use std::sync::Arc;
use std::time::Duration;

pub struct LockingInterceptor {
    lock_manager: Arc<LockManager>,
    clustering: Arc<dyn ClusteringDependentLogic>,
    lock_acquisition_timeout: Duration,
}

impl LockingInterceptor {
    pub fn new(
        lock_manager: Arc<LockManager>,
        clustering: Arc<dyn ClusteringDependentLogic>,
        lock_acquisition_timeout: Duration,
    ) -> Self {
        Self {
            lock_manager,
            clustering,
            lock_acquisition_timeout,
        }
    }

    /// Lock `key` for the invocation, waiting at most its lock timeout
    pub fn lock_key(&self, ctx: &mut InvocationContext, key: &Key) -> Result<()> {
        self.lock_manager
            .acquire_for(ctx, key, self.lock_acquisition_timeout)
    }

    /// Lock every key of one command
    ///
    /// If a key cannot be locked, the keys this call newly locked are
    /// released before the error is returned. Locks the invocation held
    /// beforehand are kept.
    pub fn lock_keys(&self, ctx: &mut InvocationContext, keys: &[Key]) -> Result<()> {
        let mut acquired = Vec::new();
        for key in keys {
            let already_held = ctx.has_locked_key(key);
            if let Err(e) = self.lock_key(ctx, key) {
                let owner = ctx.owner();
                for key in &acquired {
                    ctx.remove_locked_key(key);
                    self.lock_manager.release(owner, key);
                }
                tracing::debug!(%key, released = acquired.len(), "lock failed, released keys locked by this command");
                return Err(e);
            }
            if !already_held && ctx.has_locked_key(key) {
                acquired.push(key.clone());
            }
        }
        Ok(())
    }

    /// Release every lock the invocation holds
    ///
    /// Tokens are drained from the context, so a second call releases
    /// nothing.
    pub fn release_locks(&self, ctx: &mut InvocationContext) {
        let owner = ctx.owner();
        for key in ctx.take_locked_keys() {
            if !self.lock_manager.release(owner, &key) {
                tracing::warn!(%key, %owner, "lock token without a held lock");
            }
        }
    }

    /// Commit the invocation's working set
    pub fn commit(&self, ctx: &InvocationContext) -> Result<()> {
        commit_context_entries(ctx, self.clustering.as_ref())
    }

    /// Run `body`, then release the invocation's locks whatever it returned
    ///
    /// The body's error is returned unchanged.
    fn with_lock_scope<T>(
        &self,
        ctx: &mut InvocationContext,
        body: impl FnOnce(&mut InvocationContext) -> Result<T>,
    ) -> Result<T> {
        let result = body(ctx);
        self.release_locks(ctx);
        result
    }

    /// Lock, invoke, commit. Any failure discards the working set.
    fn invoke_and_commit(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        next: Next<'_>,
        keys: &[Key],
    ) -> Result<CommandResult> {
        let outcome = self
            .lock_keys(ctx, keys)
            .and_then(|()| next.invoke(ctx, command))
            .and_then(|result| self.commit(ctx).map(|()| result));

        if let Err(e) = &outcome {
            tracing::debug!(command = command.name(), error = %e, "invocation failed, releasing locks");
            ctx.discard_entries();
        }
        outcome
    }

    fn handle_local(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let in_transaction = ctx.is_in_transaction();
        match command {
            Command::Get { .. } => next.invoke(ctx, command),
            Command::Put { .. }
            | Command::PutAll { .. }
            | Command::Remove { .. }
            | Command::Replace { .. }
            | Command::Evict { .. } => {
                let keys = command.lock_keys().unwrap_or_default();
                if in_transaction {
                    // Held until the transaction completes
                    self.lock_keys(ctx, &keys)?;
                    next.invoke(ctx, command)
                } else {
                    self.with_lock_scope(ctx, |ctx| {
                        self.invoke_and_commit(ctx, command, next, &keys)
                    })
                }
            }
            Command::Invalidate { .. } | Command::InvalidateL1 { .. } | Command::Clear => {
                if in_transaction {
                    next.invoke(ctx, command)
                } else {
                    self.with_lock_scope(ctx, |ctx| self.invoke_and_commit(ctx, command, next, &[]))
                }
            }
            Command::Prepare(prepare) => {
                if prepare.one_phase_commit {
                    self.with_lock_scope(ctx, |ctx| next.invoke(ctx, command))
                } else {
                    next.invoke(ctx, command)
                }
            }
            Command::Commit { .. } | Command::Rollback { .. } => {
                self.with_lock_scope(ctx, |ctx| next.invoke(ctx, command))
            }
        }
    }
}

impl Interceptor for LockingInterceptor {
    fn name(&self) -> &'static str {
        "LockingInterceptor"
    }

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        if !ctx.is_origin_local() {
            // Remote transactions were locked on their originating node
            return match command {
                Command::Commit { .. } | Command::Rollback { .. } => {
                    self.with_lock_scope(ctx, |ctx| next.invoke(ctx, command))
                }
                _ => next.invoke(ctx, command),
            };
        }

        if let Command::Evict { .. } = command {
            // Evict never waits on contention; later commands of the same
            // transaction do
            return ctx.with_flag(Flag::ZeroLockAcquisitionTimeout, |ctx| {
                self.handle_local(ctx, command, next)
            });
        }
        self.handle_local(ctx, command, next)
    }
}
