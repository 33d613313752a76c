//! Shared helpers for the cache integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use proven_cache::{
    Cache, CacheConfig, ClusteringDependentLogic, Command, CommandResult, DataContainer,
    InMemoryDataContainer, Interceptor, InvocationContext, Key, Next, Result, StagedEntry,
    StoredEntry, Value,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Install a subscriber so `RUST_LOG=proven_cache=trace` shows pipeline logs
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(name: &str) -> Key {
    Key::from(name)
}

pub fn int(n: i64) -> Value {
    Value::Integer(n)
}

/// Config with a short lock timeout so contention tests finish quickly
pub fn fast_config() -> CacheConfig {
    CacheConfig::default().with_lock_acquisition_timeout(Duration::from_millis(50))
}

// ============================================================================
// Container that counts reads
// ============================================================================

#[derive(Default)]
pub struct CountingContainer {
    inner: InMemoryDataContainer,
    gets: Mutex<HashMap<Key, usize>>,
}

impl CountingContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_count(&self, key: &Key) -> usize {
        self.gets.lock().get(key).copied().unwrap_or(0)
    }
}

impl DataContainer for CountingContainer {
    fn get(&self, key: &Key) -> Option<StoredEntry> {
        *self.gets.lock().entry(key.clone()).or_insert(0) += 1;
        self.inner.get(key)
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        self.inner.put(key, value)
    }

    fn remove(&self, key: &Key) -> Result<Option<StoredEntry>> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Vec<Key> {
        self.inner.keys()
    }

    fn entries(&self) -> Vec<StoredEntry> {
        self.inner.entries()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

// ============================================================================
// Ownership fixed at construction, recording every commit
// ============================================================================

pub struct StaticOwnership {
    container: Arc<dyn DataContainer>,
    /// `None` means every key is owned
    owned: Option<HashSet<Key>>,
    committed: Mutex<Vec<Key>>,
}

impl StaticOwnership {
    pub fn owns_everything(container: Arc<dyn DataContainer>) -> Self {
        Self {
            container,
            owned: None,
            committed: Mutex::new(Vec::new()),
        }
    }

    pub fn owning(container: Arc<dyn DataContainer>, keys: &[&str]) -> Self {
        Self {
            container,
            owned: Some(keys.iter().map(|k| Key::from(*k)).collect()),
            committed: Mutex::new(Vec::new()),
        }
    }

    /// Keys passed to `commit_entry`, in call order
    pub fn committed(&self) -> Vec<Key> {
        self.committed.lock().clone()
    }
}

impl ClusteringDependentLogic for StaticOwnership {
    fn local_node_is_owner(&self, key: &Key) -> bool {
        self.owned.as_ref().is_none_or(|owned| owned.contains(key))
    }

    fn commit_entry(&self, entry: &StagedEntry, _skip_ownership_check: bool) -> Result<()> {
        self.committed.lock().push(entry.key().clone());
        if entry.is_removed() {
            self.container.remove(entry.key())?;
        } else if let Some(value) = entry.value() {
            self.container.put(entry.key().clone(), value.clone())?;
        }
        Ok(())
    }
}

// ============================================================================
// Interceptor recording what reaches the call stage
// ============================================================================

#[derive(Default)]
pub struct RecordingInterceptor {
    seen: Mutex<Vec<Command>>,
}

impl RecordingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<Command> {
        self.seen.lock().clone()
    }

    /// Recorded commands other than transaction boundaries
    pub fn modifications(&self) -> Vec<Command> {
        self.seen
            .lock()
            .iter()
            .filter(|c| {
                !matches!(
                    c,
                    Command::Prepare(_) | Command::Commit { .. } | Command::Rollback { .. }
                )
            })
            .cloned()
            .collect()
    }
}

impl Interceptor for RecordingInterceptor {
    fn name(&self) -> &'static str {
        "RecordingInterceptor"
    }

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: &mut Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        self.seen.lock().push(command.clone());
        next.invoke(ctx, command)
    }
}

/// A cache with recording collaborators
pub struct Harness {
    pub cache: Cache,
    pub container: Arc<CountingContainer>,
    pub ownership: Arc<StaticOwnership>,
    pub recorder: Arc<RecordingInterceptor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Harness whose node owns only `owned`
    pub fn owning(owned: &[&str]) -> Self {
        Self::build(Some(owned))
    }

    fn build(owned: Option<&[&str]>) -> Self {
        init_tracing();
        let container = Arc::new(CountingContainer::new());
        let ownership = Arc::new(match owned {
            Some(keys) => StaticOwnership::owning(container.clone(), keys),
            None => StaticOwnership::owns_everything(container.clone()),
        });
        let recorder = Arc::new(RecordingInterceptor::new());
        let cache = Cache::builder(fast_config())
            .with_container(container.clone())
            .with_clustering(ownership.clone())
            .with_interceptor(recorder.clone())
            .build();
        Self {
            cache,
            container,
            ownership,
            recorder,
        }
    }

    /// Write straight into the container, bypassing the chain
    pub fn seed(&self, entries: &[(&str, i64)]) {
        for (k, v) in entries {
            self.container
                .put(key(k), int(*v))
                .expect("seeding the container");
        }
    }
}
