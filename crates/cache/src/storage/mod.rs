//! Storage module for the cache
//!
//! Provides the authoritative data container, the entry types that move
//! between it and the per-invocation working set, and key-level locking.

pub mod container;
pub mod entry;
pub mod lock;

// Re-export main types
pub use container::{DataContainer, InMemoryDataContainer};
pub use entry::{StagedEntry, StoredEntry};
pub use lock::{LockManager, LockOwner};
