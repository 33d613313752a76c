//! Terminal stage: applies each command to the working set
//!
//! By the time a command arrives here every key it touches has been staged,
//! so this stage only reads and mutates staged entries. It never touches the
//! data container.

use super::{Interceptor, Next};
use crate::context::InvocationContext;
use crate::error::{CacheError, Result};
use crate::storage::entry::StagedEntry;
use crate::types::{Command, CommandResult, Key};

#[derive(Debug, Default)]
pub struct CallInterceptor;

impl CallInterceptor {
    pub fn new() -> Self {
        Self
    }

    fn staged<'c>(ctx: &'c mut InvocationContext, key: &Key) -> Result<&'c mut StagedEntry> {
        ctx.lookup_entry_mut(key)
            .ok_or_else(|| CacheError::StagingFailure {
                key: key.clone(),
                reason: "key was not staged before execution".to_string(),
            })
    }

    fn invalidate(ctx: &mut InvocationContext, keys: &[Key]) {
        for key in keys {
            if let Some(entry) = ctx.lookup_entry_mut(key) {
                if entry.exists() {
                    entry.mark_removed();
                }
            }
        }
    }
}

impl Interceptor for CallInterceptor {
    fn name(&self) -> &'static str {
        "CallInterceptor"
    }

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        _next: Next<'_>,
    ) -> Result<CommandResult> {
        let result = match command {
            Command::Get { key } => CommandResult::Value(
                ctx.lookup_entry(key).and_then(|entry| entry.value().cloned()),
            ),
            Command::Put {
                key,
                value,
                put_if_absent,
            } => {
                let entry = Self::staged(ctx, key)?;
                if *put_if_absent && entry.exists() {
                    CommandResult::Value(entry.value().cloned())
                } else {
                    CommandResult::Value(entry.set_value(value.clone()))
                }
            }
            Command::PutAll { entries } => {
                for (key, value) in entries.iter() {
                    match ctx.lookup_entry_mut(key) {
                        Some(entry) => {
                            entry.set_value(value.clone());
                        }
                        None => tracing::trace!(%key, "key not staged, skipping"),
                    }
                }
                CommandResult::Done
            }
            Command::Remove { key } | Command::Evict { key } => {
                let entry = Self::staged(ctx, key)?;
                if entry.exists() {
                    CommandResult::Value(entry.mark_removed())
                } else {
                    CommandResult::Value(None)
                }
            }
            Command::Replace {
                key,
                value,
                expected,
            } => {
                let entry = Self::staged(ctx, key)?;
                match expected {
                    Some(expected) => {
                        let applied = entry.value() == Some(&*expected);
                        if applied {
                            entry.set_value(value.clone());
                        }
                        CommandResult::Applied(applied)
                    }
                    None if entry.exists() => CommandResult::Value(entry.set_value(value.clone())),
                    None => CommandResult::Value(None),
                }
            }
            Command::Invalidate { keys } | Command::InvalidateL1 { keys } => {
                Self::invalidate(ctx, keys);
                CommandResult::Done
            }
            Command::Clear => {
                for entry in ctx.working_set_mut().iter_mut() {
                    if entry.exists() {
                        entry.mark_removed();
                    }
                }
                CommandResult::Done
            }
            Command::Prepare(_) | Command::Commit { .. } | Command::Rollback { .. } => {
                CommandResult::Done
            }
        };
        Ok(result)
    }
}
