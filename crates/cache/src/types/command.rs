//! Cache commands
//!
//! Every client operation and every transaction boundary is a [`Command`]
//! variant. Interceptors dispatch on the variant with a plain `match`.

use crate::types::{Key, TransactionId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A command travelling through the interceptor chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Read a value
    Get { key: Key },

    /// Write a value, optionally only when the key is absent
    Put {
        key: Key,
        value: Value,
        put_if_absent: bool,
    },

    /// Write several values at once
    PutAll { entries: BTreeMap<Key, Value> },

    /// Remove a key
    Remove { key: Key },

    /// Replace the value of an existing key, optionally only when it
    /// currently holds `expected`
    Replace {
        key: Key,
        value: Value,
        expected: Option<Value>,
    },

    /// Drop a key from this node without contention
    Evict { key: Key },

    /// Invalidate keys held by this node
    Invalidate { keys: Vec<Key> },

    /// Best-effort invalidation of near-cache copies
    InvalidateL1 { keys: Vec<Key> },

    /// Remove every key in the store
    Clear,

    /// First phase of a transaction commit
    Prepare(PrepareCommand),

    /// Second phase of a two-phase commit
    Commit { gtx: TransactionId },

    /// Abort a transaction
    Rollback { gtx: TransactionId },
}

impl Command {
    /// Keys this command needs exclusive locks on before running
    ///
    /// Returns `None` for commands that are not locked up front.
    pub fn lock_keys(&self) -> Option<Vec<Key>> {
        match self {
            Command::Put { key, .. }
            | Command::Remove { key }
            | Command::Replace { key, .. }
            | Command::Evict { key } => Some(vec![key.clone()]),
            Command::PutAll { entries } => Some(entries.keys().cloned().collect()),
            _ => None,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "Get",
            Command::Put { .. } => "Put",
            Command::PutAll { .. } => "PutAll",
            Command::Remove { .. } => "Remove",
            Command::Replace { .. } => "Replace",
            Command::Evict { .. } => "Evict",
            Command::Invalidate { .. } => "Invalidate",
            Command::InvalidateL1 { .. } => "InvalidateL1",
            Command::Clear => "Clear",
            Command::Prepare(_) => "Prepare",
            Command::Commit { .. } => "Commit",
            Command::Rollback { .. } => "Rollback",
        }
    }

    /// Convert this command to a JSON value for diagnostics
    pub fn as_json_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Prepare request of a transaction, carrying its ordered modifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareCommand {
    pub gtx: TransactionId,
    pub modifications: Vec<Command>,
    /// Prepare and commit in a single round
    pub one_phase_commit: bool,
}

impl PrepareCommand {
    pub fn new(gtx: TransactionId, modifications: Vec<Command>, one_phase_commit: bool) -> Self {
        Self {
            gtx,
            modifications,
            one_phase_commit,
        }
    }
}

/// Result returned by the chain for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// The value read, or the value held before a write
    Value(Option<Value>),
    /// Whether a conditional write was applied
    Applied(bool),
    /// The command produced no value
    Done,
}

impl CommandResult {
    /// Take the value out of a `Value` result
    pub fn into_value(self) -> Option<Value> {
        match self {
            CommandResult::Value(value) => value,
            _ => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CommandResult::Applied(true))
    }
}
