//! Error types for the cache pipeline

use std::time::Duration;

use thiserror::Error;

use crate::storage::lock::LockOwner;
use crate::types::{Key, TransactionId};

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the interceptor chain
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A per-key lock could not be acquired within the timeout
    #[error("Unable to acquire lock on key {key} after {timeout:?} (held by {holder:?})")]
    LockTimeout {
        key: Key,
        holder: Option<LockOwner>,
        timeout: Duration,
    },

    /// Entry could not be staged into the working set
    #[error("Unable to stage key {key}: {reason}")]
    StagingFailure { key: Key, reason: String },

    /// The store rejected a final commit
    #[error("Failed to commit key {key}: {reason}")]
    CommitFailure { key: Key, reason: String },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl CacheError {
    /// Whether this is a lock acquisition timeout
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, CacheError::LockTimeout { .. })
    }

    /// The key this error is scoped to, if any
    pub fn key(&self) -> Option<&Key> {
        match self {
            CacheError::LockTimeout { key, .. }
            | CacheError::StagingFailure { key, .. }
            | CacheError::CommitFailure { key, .. } => Some(key),
            _ => None,
        }
    }
}
