//! Entry wrapping stage
//!
//! Makes sure every key a command touches is staged in the invocation's
//! working set before the rest of the chain runs, and commits the working
//! set at transaction boundaries. Prepares of transactions started on other
//! nodes are replayed through [`ReplayVisitor`].

use super::{Interceptor, Next, commit_context_entries};
use crate::clustering::ClusteringDependentLogic;
use crate::context::{Flag, InvocationContext};
use crate::error::Result;
use crate::factory::{EntryFactory, WriteIntent};
use crate::storage::container::DataContainer;
use crate::transport::Transport;
use crate::types::{Command, CommandResult, Key};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct EntryWrappingInterceptor {
    entry_factory: Arc<dyn EntryFactory>,
    container: Arc<dyn DataContainer>,
    clustering: Arc<dyn ClusteringDependentLogic>,
    transport: Arc<dyn Transport>,
}

impl EntryWrappingInterceptor {
    pub fn new(
        entry_factory: Arc<dyn EntryFactory>,
        container: Arc<dyn DataContainer>,
        clustering: Arc<dyn ClusteringDependentLogic>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            entry_factory,
            container,
            clustering,
            transport,
        }
    }

    /// Stage the keys of a single (non-boundary) command
    fn wrap_command(&self, ctx: &mut InvocationContext, command: &Command) -> Result<()> {
        let factory = self.entry_factory.as_ref();
        match command {
            Command::Get { key } => factory.wrap_entry_for_reading(ctx, key),
            Command::Put {
                key, put_if_absent, ..
            } => factory.wrap_entry_for_put(ctx, key, !put_if_absent),
            Command::PutAll { entries } => {
                for key in entries.keys() {
                    factory.wrap_entry_for_writing(ctx, key, WriteIntent::PutAll)?;
                }
                Ok(())
            }
            Command::Remove { key } | Command::Evict { key } => {
                factory.wrap_entry_for_remove(ctx, key)
            }
            Command::Replace { key, .. } => factory.wrap_entry_for_replace(ctx, key),
            Command::Invalidate { keys } => {
                for key in keys {
                    match factory.wrap_entry_for_writing(ctx, key, WriteIntent::Invalidate) {
                        Ok(()) => {}
                        Err(e) if e.is_lock_timeout() => self.report_invalidation_timeout(key),
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            Command::Clear => {
                for key in self.container.keys() {
                    factory.wrap_entry_for_clear(ctx, &key)?;
                }
                Ok(())
            }
            Command::InvalidateL1 { .. }
            | Command::Prepare(_)
            | Command::Commit { .. }
            | Command::Rollback { .. } => Ok(()),
        }
    }

    fn report_invalidation_timeout(&self, key: &Key) {
        tracing::warn!(
            %key,
            address = %self.transport.address(),
            "unable to lock key for invalidation, skipping it"
        );
    }

    /// Best-effort invalidation: contended keys are dropped from the command
    fn visit_invalidate_l1(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        if let Command::InvalidateL1 { keys } = command {
            if !keys.is_empty() {
                let factory = self.entry_factory.as_ref();
                let retained = ctx.with_flag(Flag::ZeroLockAcquisitionTimeout, |ctx| {
                    let mut retained = Vec::with_capacity(keys.len());
                    for key in keys.iter() {
                        match factory.wrap_entry_for_writing(ctx, key, WriteIntent::Invalidate) {
                            Ok(()) => retained.push(key.clone()),
                            Err(e) if e.is_lock_timeout() => self.report_invalidation_timeout(key),
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(retained)
                })?;

                if retained.is_empty() {
                    tracing::debug!("no key could be locked for L1 invalidation");
                    return Ok(CommandResult::Done);
                }
                *keys = retained;
            }
        }
        next.invoke(ctx, command)
    }

    fn visit_prepare(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let (one_phase_commit, replay) = match command {
            Command::Prepare(prepare) => (
                prepare.one_phase_commit,
                // Locks were taken on the originating node; only apply changes
                (!ctx.is_origin_local()).then(|| prepare.modifications.clone()),
            ),
            _ => (false, None),
        };

        if let Some(modifications) = replay {
            tracing::debug!(
                gtx = ?ctx.gtx(),
                modifications = modifications.len(),
                "replaying remote prepare"
            );
            let visitor = ReplayVisitor::new(
                self.entry_factory.as_ref(),
                self.container.as_ref(),
                self.clustering.as_ref(),
                next,
            );
            for modification in &modifications {
                visitor.visit(ctx, modification)?;
            }
        }

        let result = next.invoke(ctx, command)?;
        if one_phase_commit {
            commit_context_entries(ctx, self.clustering.as_ref())?;
        }
        Ok(result)
    }
}

impl Interceptor for EntryWrappingInterceptor {
    fn name(&self) -> &'static str {
        "EntryWrappingInterceptor"
    }

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        match command {
            Command::Prepare(_) => self.visit_prepare(ctx, command, next),
            Command::InvalidateL1 { .. } => self.visit_invalidate_l1(ctx, command, next),
            Command::Commit { .. } => {
                let result = next.invoke(ctx, command)?;
                commit_context_entries(ctx, self.clustering.as_ref())?;
                Ok(result)
            }
            Command::Rollback { .. } => {
                let result = next.invoke(ctx, command);
                ctx.discard_entries();
                result
            }
            _ => {
                self.wrap_command(ctx, command)?;
                next.invoke(ctx, command)
            }
        }
    }
}

/// Applies a remote transaction's modifications to the local working set
///
/// Only keys this node owns are staged, and each key at most once: a
/// prepare replayed again during recovery finds its keys already staged and
/// does not run the rest of the chain for them a second time.
pub struct ReplayVisitor<'a> {
    entry_factory: &'a dyn EntryFactory,
    container: &'a dyn DataContainer,
    clustering: &'a dyn ClusteringDependentLogic,
    next: Next<'a>,
}

impl<'a> ReplayVisitor<'a> {
    pub fn new(
        entry_factory: &'a dyn EntryFactory,
        container: &'a dyn DataContainer,
        clustering: &'a dyn ClusteringDependentLogic,
        next: Next<'a>,
    ) -> Self {
        Self {
            entry_factory,
            container,
            clustering,
            next,
        }
    }

    /// Replay one modification
    pub fn visit(&self, ctx: &mut InvocationContext, modification: &Command) -> Result<()> {
        match modification {
            Command::Clear => {
                let mut wrapped = false;
                for key in self.container.keys() {
                    if Self::not_wrapped(ctx, &key) {
                        self.entry_factory.wrap_entry_for_clear(ctx, &key)?;
                        wrapped = true;
                    }
                }
                if wrapped {
                    self.next.invoke(ctx, &mut Command::Clear)?;
                }
            }
            Command::PutAll { entries } => {
                let mut wrapped = BTreeMap::new();
                for (key, value) in entries {
                    if self.clustering.local_node_is_owner(key) && Self::not_wrapped(ctx, key) {
                        self.entry_factory
                            .wrap_entry_for_writing(ctx, key, WriteIntent::PutAll)?;
                        wrapped.insert(key.clone(), value.clone());
                    }
                }
                if !wrapped.is_empty() {
                    self.next
                        .invoke(ctx, &mut Command::PutAll { entries: wrapped })?;
                }
            }
            Command::Put {
                key, put_if_absent, ..
            } => {
                if self.should_replay(ctx, key) {
                    self.entry_factory
                        .wrap_entry_for_put(ctx, key, !put_if_absent)?;
                    self.next.invoke(ctx, &mut modification.clone())?;
                }
            }
            Command::Remove { key } => {
                if self.should_replay(ctx, key) {
                    self.entry_factory.wrap_entry_for_remove(ctx, key)?;
                    self.next.invoke(ctx, &mut modification.clone())?;
                }
            }
            Command::Replace { key, .. } => {
                if self.should_replay(ctx, key) {
                    self.entry_factory.wrap_entry_for_replace(ctx, key)?;
                    self.next.invoke(ctx, &mut modification.clone())?;
                }
            }
            other => {
                tracing::trace!(command = other.name(), "not replayed");
            }
        }
        Ok(())
    }

    fn should_replay(&self, ctx: &InvocationContext, key: &Key) -> bool {
        self.clustering.local_node_is_owner(key) && Self::not_wrapped(ctx, key)
    }

    // Recovery replays prepare against a context that may already hold the
    // key. TODO: revisit once concurrent recovery of the same transaction
    // is serialized upstream.
    fn not_wrapped(ctx: &InvocationContext, key: &Key) -> bool {
        !ctx.is_staged(key)
    }
}
