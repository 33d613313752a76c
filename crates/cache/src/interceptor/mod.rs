//! Interceptor chain
//!
//! Commands pass through an ordered list of interceptors. Each interceptor
//! receives a [`Next`] handle for the remainder of the chain and decides
//! whether, when and how often to invoke it.

pub mod call;
pub mod entry_wrapping;
pub mod locking;

pub use call::CallInterceptor;
pub use entry_wrapping::{EntryWrappingInterceptor, ReplayVisitor};
pub use locking::LockingInterceptor;

use crate::clustering::ClusteringDependentLogic;
use crate::context::{Flag, InvocationContext};
use crate::error::Result;
use crate::types::{Command, CommandResult};
use std::sync::Arc;

/// One stage of the chain
pub trait Interceptor: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        next: Next<'_>,
    ) -> Result<CommandResult>;
}

/// The part of the chain after the current interceptor
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    pub fn new(rest: &'a [Arc<dyn Interceptor>]) -> Self {
        Self { rest }
    }

    /// Run the rest of the chain
    ///
    /// An exhausted chain completes with [`CommandResult::Done`].
    pub fn invoke(self, ctx: &mut InvocationContext, command: &mut Command) -> Result<CommandResult> {
        match self.rest.split_first() {
            Some((head, tail)) => head.handle(ctx, command, Next::new(tail)),
            None => Ok(CommandResult::Done),
        }
    }
}

/// Ordered interceptor list
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor at the end of the chain
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn invoke(&self, ctx: &mut InvocationContext, command: &mut Command) -> Result<CommandResult> {
        tracing::trace!(command = command.name(), owner = %ctx.owner(), "invoking chain");
        Next::new(&self.interceptors).invoke(ctx, command)
    }

    /// Interceptor names in chain order
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }
}

/// Commit the working set of `ctx` to the store
///
/// Entries are committed last-staged first; entries that were not changed
/// are skipped. The first commit failure aborts the pass and is returned.
pub fn commit_context_entries(
    ctx: &InvocationContext,
    clustering: &dyn ClusteringDependentLogic,
) -> Result<()> {
    let skip_ownership_check = ctx.has_flag(Flag::SkipOwnershipCheck);
    tracing::trace!(entries = ctx.working_set().len(), "committing context entries");

    for entry in ctx.working_set().iter().rev() {
        if entry.is_changed() {
            clustering.commit_entry(entry, skip_ownership_check)?;
        } else {
            tracing::trace!(key = %entry.key(), "entry not changed, not committing");
        }
    }
    Ok(())
}
