//! Cache facade
//!
//! Wires the collaborators into the chain
//! `LockingInterceptor -> EntryWrappingInterceptor -> [extra] -> CallInterceptor`
//! and runs every client operation in its own [`InvocationContext`].

use crate::clustering::{ClusteringDependentLogic, DistributionLogic, LocalLogic};
use crate::config::CacheConfig;
use crate::context::{Flag, InvocationContext};
use crate::error::{CacheError, Result};
use crate::factory::{DefaultEntryFactory, EntryFactory};
use crate::interceptor::{
    CallInterceptor, EntryWrappingInterceptor, Interceptor, InterceptorChain, LockingInterceptor,
};
use crate::storage::container::{DataContainer, InMemoryDataContainer};
use crate::storage::lock::{LockManager, LockOwner};
use crate::transport::{LocalTransport, Transport};
use crate::types::{Address, Command, CommandResult, Key, PrepareCommand, TransactionId, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Builder for a [`Cache`]
///
/// Collaborators that are not supplied get the standalone defaults.
#[derive(Default)]
pub struct CacheBuilder {
    config: CacheConfig,
    container: Option<Arc<dyn DataContainer>>,
    clustering: Option<Arc<dyn ClusteringDependentLogic>>,
    distribution: Option<(Address, Vec<Address>)>,
    transport: Option<Arc<dyn Transport>>,
    entry_factory: Option<Arc<dyn EntryFactory>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl CacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_container(mut self, container: Arc<dyn DataContainer>) -> Self {
        self.container = Some(container);
        self
    }

    /// Use custom ownership logic; it must commit into the same container
    pub fn with_clustering(mut self, clustering: Arc<dyn ClusteringDependentLogic>) -> Self {
        self.clustering = Some(clustering);
        self
    }

    /// Distribute keys over `members` with this node at `local`
    pub fn with_distribution(mut self, local: Address, members: Vec<Address>) -> Self {
        self.distribution = Some((local, members));
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_entry_factory(mut self, entry_factory: Arc<dyn EntryFactory>) -> Self {
        self.entry_factory = Some(entry_factory);
        self
    }

    /// Add an interceptor between entry wrapping and the call stage
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Cache {
        let config = self.config;
        let container: Arc<dyn DataContainer> = self
            .container
            .unwrap_or_else(|| Arc::new(InMemoryDataContainer::new()));
        let lock_manager = Arc::new(LockManager::new());

        let transport: Arc<dyn Transport> = match (&self.transport, &self.distribution) {
            (Some(transport), _) => transport.clone(),
            (None, Some((local, _))) => Arc::new(LocalTransport::new(local.clone())),
            (None, None) => Arc::new(LocalTransport::default()),
        };

        let clustering: Arc<dyn ClusteringDependentLogic> = match (self.clustering, self.distribution) {
            (Some(clustering), _) => clustering,
            (None, Some((local, members))) => Arc::new(DistributionLogic::new(
                container.clone(),
                local,
                members,
                config.num_owners,
                config.hash_seed,
            )),
            (None, None) => Arc::new(LocalLogic::new(container.clone())),
        };

        let entry_factory: Arc<dyn EntryFactory> = self.entry_factory.unwrap_or_else(|| {
            Arc::new(DefaultEntryFactory::new(
                container.clone(),
                lock_manager.clone(),
                config.lock_acquisition_timeout,
            ))
        });

        let mut chain = InterceptorChain::new()
            .with(Arc::new(LockingInterceptor::new(
                lock_manager.clone(),
                clustering.clone(),
                config.lock_acquisition_timeout,
            )))
            .with(Arc::new(EntryWrappingInterceptor::new(
                entry_factory,
                container.clone(),
                clustering.clone(),
                transport.clone(),
            )));
        for interceptor in self.interceptors {
            chain = chain.with(interceptor);
        }
        let chain = chain.with(Arc::new(CallInterceptor::new()));

        tracing::debug!(address = %transport.address(), chain = ?chain.names(), "cache started");

        Cache {
            config,
            container,
            lock_manager,
            clustering,
            transport,
            chain,
            next_owner: AtomicU64::new(1),
            remote_transactions: Mutex::new(HashMap::new()),
        }
    }
}

/// A cache node
pub struct Cache {
    config: CacheConfig,
    container: Arc<dyn DataContainer>,
    lock_manager: Arc<LockManager>,
    clustering: Arc<dyn ClusteringDependentLogic>,
    transport: Arc<dyn Transport>,
    chain: InterceptorChain,
    next_owner: AtomicU64,
    /// Contexts of remote transactions prepared in two phases
    remote_transactions: Mutex<HashMap<TransactionId, InvocationContext>>,
}

impl Cache {
    /// Standalone cache with the given config
    pub fn new(config: CacheConfig) -> Self {
        CacheBuilder::new(config).build()
    }

    pub fn builder(config: CacheConfig) -> CacheBuilder {
        CacheBuilder::new(config)
    }

    fn next_owner(&self) -> LockOwner {
        LockOwner(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Run a non-transactional command
    pub fn execute(&self, command: Command) -> Result<CommandResult> {
        self.execute_with_flags(command, &[])
    }

    /// Run a non-transactional command with invocation flags
    pub fn execute_with_flags(&self, mut command: Command, flags: &[Flag]) -> Result<CommandResult> {
        if matches!(
            command,
            Command::Prepare(_) | Command::Commit { .. } | Command::Rollback { .. }
        ) {
            return Err(CacheError::InvalidCommand(format!(
                "{} requires a transaction",
                command.name()
            )));
        }

        let mut ctx = InvocationContext::non_transactional(self.next_owner());
        for flag in flags {
            ctx.set_flag(*flag);
        }
        self.chain.invoke(&mut ctx, &mut command)
    }

    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.execute(Command::Get { key: key.into() })
            .map(CommandResult::into_value)
    }

    /// Store a value, returning the previous one
    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        self.execute(Command::Put {
            key: key.into(),
            value: value.into(),
            put_if_absent: false,
        })
        .map(CommandResult::into_value)
    }

    /// Store a value only if the key is absent, returning the existing value
    pub fn put_if_absent(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>> {
        self.execute(Command::Put {
            key: key.into(),
            value: value.into(),
            put_if_absent: true,
        })
        .map(CommandResult::into_value)
    }

    pub fn put_all<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let entries: BTreeMap<Key, Value> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.execute(Command::PutAll { entries }).map(|_| ())
    }

    pub fn remove(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.execute(Command::Remove { key: key.into() })
            .map(CommandResult::into_value)
    }

    /// Replace the value of an existing key, returning the previous one
    pub fn replace(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        self.execute(Command::Replace {
            key: key.into(),
            value: value.into(),
            expected: None,
        })
        .map(CommandResult::into_value)
    }

    /// Replace only if the key currently holds `expected`
    pub fn replace_if(
        &self,
        key: impl Into<Key>,
        expected: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Result<bool> {
        self.execute(Command::Replace {
            key: key.into(),
            value: value.into(),
            expected: Some(expected.into()),
        })
        .map(|result| result.is_applied())
    }

    pub fn evict(&self, key: impl Into<Key>) -> Result<()> {
        self.execute(Command::Evict { key: key.into() }).map(|_| ())
    }

    pub fn invalidate<K: Into<Key>>(&self, keys: impl IntoIterator<Item = K>) -> Result<()> {
        let keys = keys.into_iter().map(Into::into).collect();
        self.execute(Command::Invalidate { keys }).map(|_| ())
    }

    pub fn invalidate_l1<K: Into<Key>>(&self, keys: impl IntoIterator<Item = K>) -> Result<()> {
        let keys = keys.into_iter().map(Into::into).collect();
        self.execute(Command::InvalidateL1 { keys }).map(|_| ())
    }

    pub fn clear(&self) -> Result<()> {
        self.execute(Command::Clear).map(|_| ())
    }

    /// Start a transaction on this node
    pub fn begin(&self) -> Transaction<'_> {
        let gtx = TransactionId::new();
        tracing::debug!(%gtx, "transaction started");
        Transaction {
            cache: self,
            ctx: InvocationContext::local_transaction(self.next_owner(), gtx),
            status: TransactionStatus::Active,
        }
    }

    /// Apply the prepare of a transaction started on another node
    ///
    /// One-phase prepares are committed immediately. Two-phase prepares keep
    /// their context until [`Cache::apply_remote_commit`] or
    /// [`Cache::apply_remote_rollback`]; a prepare replayed for a `gtx` that
    /// is still pending reuses its context.
    pub fn apply_remote_prepare(&self, prepare: PrepareCommand) -> Result<()> {
        let gtx = prepare.gtx;
        let one_phase_commit = prepare.one_phase_commit;
        let pending = self.remote_transactions.lock().remove(&gtx);
        let mut ctx = match pending {
            Some(ctx) => {
                tracing::debug!(%gtx, "replaying prepare of pending remote transaction");
                ctx
            }
            None => InvocationContext::remote_transaction(self.next_owner(), gtx),
        };

        self.chain.invoke(&mut ctx, &mut Command::Prepare(prepare))?;
        if !one_phase_commit {
            self.remote_transactions.lock().insert(gtx, ctx);
        }
        Ok(())
    }

    /// Commit a remote transaction prepared in two phases
    pub fn apply_remote_commit(&self, gtx: TransactionId) -> Result<()> {
        let mut ctx = self
            .remote_transactions
            .lock()
            .remove(&gtx)
            .ok_or(CacheError::TransactionNotFound(gtx))?;
        self.chain
            .invoke(&mut ctx, &mut Command::Commit { gtx })
            .map(|_| ())
    }

    /// Roll back a remote transaction; unknown transactions are ignored
    pub fn apply_remote_rollback(&self, gtx: TransactionId) -> Result<()> {
        let pending = self.remote_transactions.lock().remove(&gtx);
        match pending {
            Some(mut ctx) => self
                .chain
                .invoke(&mut ctx, &mut Command::Rollback { gtx })
                .map(|_| ()),
            None => {
                tracing::trace!(%gtx, "rollback of unknown remote transaction");
                Ok(())
            }
        }
    }

    /// Remote transactions prepared but not yet completed
    pub fn pending_remote_transactions(&self) -> Vec<TransactionId> {
        let mut pending: Vec<TransactionId> =
            self.remote_transactions.lock().keys().copied().collect();
        pending.sort();
        pending
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn container(&self) -> &Arc<dyn DataContainer> {
        &self.container
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn clustering(&self) -> &Arc<dyn ClusteringDependentLogic> {
        &self.clustering
    }

    pub fn address(&self) -> Address {
        self.transport.address()
    }

    /// Interceptor names in chain order
    pub fn interceptors(&self) -> Vec<&'static str> {
        self.chain.names()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionStatus {
    Active,
    Prepared,
    Completed,
}

/// A transaction started on this node
///
/// Writes lock their keys until the transaction completes. Dropping an
/// incomplete transaction rolls it back.
pub struct Transaction<'a> {
    cache: &'a Cache,
    ctx: InvocationContext,
    status: TransactionStatus,
}

impl Transaction<'_> {
    pub fn gtx(&self) -> TransactionId {
        // Local transaction contexts always carry a gtx
        self.ctx.gtx().unwrap_or_default()
    }

    /// Net modifications staged so far, one per changed key
    ///
    /// Keys appear in the order they were first staged. A key written
    /// several times contributes only its final state.
    pub fn modifications(&self) -> Vec<Command> {
        self.ctx
            .working_set()
            .iter()
            .filter(|entry| entry.is_changed())
            .map(|entry| match entry.value() {
                Some(value) => Command::Put {
                    key: entry.key().clone(),
                    value: value.clone(),
                    put_if_absent: false,
                },
                None => Command::Remove {
                    key: entry.key().clone(),
                },
            })
            .collect()
    }

    pub fn set_flag(&mut self, flag: Flag) {
        self.ctx.set_flag(flag);
    }

    /// Bound lock waits of every later command in this transaction
    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.ctx.set_lock_timeout(timeout);
    }

    /// Run a command inside the transaction
    pub fn execute(&mut self, mut command: Command) -> Result<CommandResult> {
        if self.status != TransactionStatus::Active {
            return Err(CacheError::InvalidCommand(format!(
                "transaction {} is no longer active",
                self.gtx()
            )));
        }
        if matches!(
            command,
            Command::Prepare(_) | Command::Commit { .. } | Command::Rollback { .. }
        ) {
            return Err(CacheError::InvalidCommand(format!(
                "{} is issued by the transaction itself",
                command.name()
            )));
        }

        self.cache.chain.invoke(&mut self.ctx, &mut command)
    }

    pub fn get(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.execute(Command::Get { key: key.into() })
            .map(CommandResult::into_value)
    }

    pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<Option<Value>> {
        self.execute(Command::Put {
            key: key.into(),
            value: value.into(),
            put_if_absent: false,
        })
        .map(CommandResult::into_value)
    }

    pub fn put_all<K, V>(&mut self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let entries: BTreeMap<Key, Value> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.execute(Command::PutAll { entries }).map(|_| ())
    }

    pub fn remove(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.execute(Command::Remove { key: key.into() })
            .map(CommandResult::into_value)
    }

    pub fn replace(
        &mut self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>> {
        self.execute(Command::Replace {
            key: key.into(),
            value: value.into(),
            expected: None,
        })
        .map(CommandResult::into_value)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.execute(Command::Clear).map(|_| ())
    }

    fn prepare_command(&self, one_phase_commit: bool) -> PrepareCommand {
        PrepareCommand::new(self.gtx(), self.modifications(), one_phase_commit)
    }

    fn finish(&mut self, mut command: Command) -> Result<()> {
        self.status = TransactionStatus::Completed;
        self.cache
            .chain
            .invoke(&mut self.ctx, &mut command)
            .map(|_| ())
    }

    /// Prepare and commit in a single round
    pub fn commit(mut self) -> Result<()> {
        if self.status != TransactionStatus::Active {
            return Err(CacheError::InvalidCommand(format!(
                "transaction {} is already prepared",
                self.gtx()
            )));
        }
        let prepare = self.prepare_command(true);
        self.finish(Command::Prepare(prepare))
    }

    /// First phase of a two-phase commit
    ///
    /// Returns the prepare to ship to the other participants.
    pub fn prepare(&mut self) -> Result<PrepareCommand> {
        if self.status != TransactionStatus::Active {
            return Err(CacheError::InvalidCommand(format!(
                "transaction {} is not active",
                self.gtx()
            )));
        }
        let prepare = self.prepare_command(false);
        self.cache
            .chain
            .invoke(&mut self.ctx, &mut Command::Prepare(prepare.clone()))?;
        self.status = TransactionStatus::Prepared;
        Ok(prepare)
    }

    /// Second phase of a two-phase commit
    pub fn commit_prepared(mut self) -> Result<()> {
        if self.status != TransactionStatus::Prepared {
            return Err(CacheError::InvalidCommand(format!(
                "transaction {} was not prepared",
                self.gtx()
            )));
        }
        let gtx = self.gtx();
        self.finish(Command::Commit { gtx })
    }

    pub fn rollback(mut self) -> Result<()> {
        let gtx = self.gtx();
        self.finish(Command::Rollback { gtx })
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.status != TransactionStatus::Completed {
            let gtx = self.gtx();
            tracing::debug!(%gtx, "rolling back abandoned transaction");
            if let Err(e) = self.finish(Command::Rollback { gtx }) {
                tracing::warn!(%gtx, error = %e, "rollback failed");
            }
        }
    }
}
