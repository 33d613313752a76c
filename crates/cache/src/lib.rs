//! Transactional cache pipeline
//!
//! Commands run through an interceptor chain. The locking stage serializes
//! writers per key, the entry wrapping stage stages every touched key into a
//! per-invocation working set, and the call stage mutates the staged copies.
//! Staged changes reach the data container only when the invocation (or its
//! transaction) commits.

pub mod cache;
pub mod clustering;
pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod interceptor;
pub mod storage;
pub mod transport;
pub mod types;

pub use cache::{Cache, CacheBuilder, Transaction};
pub use clustering::{ClusteringDependentLogic, DistributionLogic, LocalLogic};
pub use config::CacheConfig;
pub use context::{Flag, InvocationContext};
pub use error::{CacheError, Result};
pub use factory::{DefaultEntryFactory, EntryFactory, WriteIntent};
pub use interceptor::{Interceptor, InterceptorChain, Next};
pub use storage::{DataContainer, InMemoryDataContainer, LockManager, LockOwner, StagedEntry, StoredEntry};
pub use transport::{LocalTransport, Transport};
pub use types::{Address, Command, CommandResult, Key, PrepareCommand, TransactionId, Value};
