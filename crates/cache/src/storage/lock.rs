//! Lock manager for cache keys
//!
//! Provides exclusive per-key locks owned by an invocation. Acquisition
//! blocks until the key is released or the timeout elapses; a zero timeout
//! makes acquisition non-blocking.

use crate::context::InvocationContext;
use crate::error::{CacheError, Result};
use crate::types::Key;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of the invocation holding a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockOwner(pub u64);

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invocation-{}", self.0)
    }
}

/// Lock manager for key-level locking
pub struct LockManager {
    /// All currently held locks (key -> holder)
    locks: Mutex<HashMap<Key, LockOwner>>,
    /// Signalled whenever a lock is released
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire an exclusive lock, waiting at most `timeout`
    ///
    /// Returns `true` if the lock was newly granted and `false` if `owner`
    /// already held it.
    pub fn acquire(&self, owner: LockOwner, key: &Key, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut locks = self.locks.lock();

        loop {
            let holder = match locks.get(key) {
                None => {
                    locks.insert(key.clone(), owner);
                    tracing::trace!(%key, %owner, "lock acquired");
                    return Ok(true);
                }
                // Re-entrant for the same owner
                Some(&holder) if holder == owner => return Ok(false),
                Some(&holder) => holder,
            };

            let expired = match deadline {
                Some(deadline) => timeout.is_zero() || Instant::now() >= deadline,
                None => false,
            };
            if expired {
                tracing::debug!(%key, %owner, %holder, ?timeout, "lock acquisition timed out");
                return Err(CacheError::LockTimeout {
                    key: key.clone(),
                    holder: Some(holder),
                    timeout,
                });
            }

            tracing::debug!(%key, %owner, %holder, "waiting for lock");
            match deadline {
                Some(deadline) => {
                    self.released.wait_until(&mut locks, deadline);
                }
                None => self.released.wait(&mut locks),
            }
        }
    }

    /// Lock `key` on behalf of an invocation and record the token in its
    /// context
    ///
    /// The wait is bounded by the context's effective timeout, falling back
    /// to `default_timeout`. A key the invocation already holds is a no-op.
    pub fn acquire_for(
        &self,
        ctx: &mut InvocationContext,
        key: &Key,
        default_timeout: Duration,
    ) -> Result<()> {
        if ctx.has_locked_key(key) {
            return Ok(());
        }
        let timeout = ctx.lock_timeout(default_timeout);
        if self.acquire(ctx.owner(), key, timeout)? {
            ctx.add_locked_key(key.clone());
        }
        Ok(())
    }

    /// Release a specific lock held by `owner`
    ///
    /// Returns `false` if `owner` did not hold the key, leaving any other
    /// holder untouched.
    pub fn release(&self, owner: LockOwner, key: &Key) -> bool {
        let mut locks = self.locks.lock();
        let held = locks.get(key) == Some(&owner);
        if held {
            locks.remove(key);
            drop(locks);
            tracing::trace!(%key, %owner, "lock released");
            self.released.notify_all();
        }
        held
    }

    /// Current holder of a key, if locked
    pub fn holder(&self, key: &Key) -> Option<LockOwner> {
        self.locks.lock().get(key).copied()
    }

    pub fn is_locked(&self, key: &Key) -> bool {
        self.locks.lock().contains_key(key)
    }

    /// Number of keys currently locked
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Flag;
    use std::sync::Arc;
    use std::thread;

    const NO_WAIT: Duration = Duration::ZERO;

    #[test]
    fn test_conflicting_acquisition() {
        let manager = LockManager::new();
        let owner1 = LockOwner(1);
        let owner2 = LockOwner(2);
        let key = Key::from("key1");

        assert_eq!(manager.acquire(owner1, &key, NO_WAIT), Ok(true));

        match manager.acquire(owner2, &key, NO_WAIT) {
            Err(CacheError::LockTimeout { key: k, holder, .. }) => {
                assert_eq!(k, key);
                assert_eq!(holder, Some(owner1));
            }
            other => panic!("Expected lock timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_reentrant_locks() {
        let manager = LockManager::new();
        let owner = LockOwner(1);
        let key = Key::from("key1");

        assert_eq!(manager.acquire(owner, &key, NO_WAIT), Ok(true));
        assert_eq!(manager.acquire(owner, &key, NO_WAIT), Ok(false));
        assert_eq!(manager.lock_count(), 1);
    }

    #[test]
    fn test_release_only_by_holder() {
        let manager = LockManager::new();
        let key = Key::from("key1");

        manager.acquire(LockOwner(1), &key, NO_WAIT).unwrap();
        assert!(!manager.release(LockOwner(2), &key));
        assert_eq!(manager.holder(&key), Some(LockOwner(1)));

        assert!(manager.release(LockOwner(1), &key));
        // A second release is a no-op
        assert!(!manager.release(LockOwner(1), &key));
        assert!(!manager.is_locked(&key));
    }

    #[test]
    fn test_acquire_for_records_one_token() {
        let manager = LockManager::new();
        let mut ctx = InvocationContext::non_transactional(LockOwner(1));
        let key = Key::from("k");

        manager.acquire_for(&mut ctx, &key, NO_WAIT).unwrap();
        manager.acquire_for(&mut ctx, &key, NO_WAIT).unwrap();
        assert_eq!(ctx.locked_keys(), &[key.clone()]);
        assert_eq!(manager.holder(&key), Some(LockOwner(1)));
    }

    #[test]
    fn test_acquire_for_uses_context_timeout() {
        let manager = LockManager::new();
        let key = Key::from("k");
        manager.acquire(LockOwner(2), &key, NO_WAIT).unwrap();

        let mut ctx = InvocationContext::non_transactional(LockOwner(1));
        ctx.set_flag(Flag::ZeroLockAcquisitionTimeout);
        match manager.acquire_for(&mut ctx, &key, Duration::from_secs(10)) {
            Err(CacheError::LockTimeout { timeout, .. }) => assert_eq!(timeout, Duration::ZERO),
            other => panic!("Expected lock timeout, got {:?}", other),
        }
        assert!(ctx.locked_keys().is_empty());
    }

    #[test]
    fn test_waiter_granted_after_release() {
        let manager = Arc::new(LockManager::new());
        let key = Key::from("contended");
        manager.acquire(LockOwner(1), &key, NO_WAIT).unwrap();

        let waiter = {
            let manager = manager.clone();
            let key = key.clone();
            thread::spawn(move || manager.acquire(LockOwner(2), &key, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        manager.release(LockOwner(1), &key);

        assert_eq!(waiter.join().unwrap(), Ok(true));
        assert_eq!(manager.holder(&key), Some(LockOwner(2)));
    }

    #[test]
    fn test_timeout_elapses() {
        let manager = LockManager::new();
        let key = Key::from("busy");
        manager.acquire(LockOwner(1), &key, NO_WAIT).unwrap();

        let started = Instant::now();
        let result = manager.acquire(LockOwner(2), &key, Duration::from_millis(30));
        assert!(result.unwrap_err().is_lock_timeout());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
