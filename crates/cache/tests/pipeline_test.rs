//! Staging, locking and commit behaviour of the interceptor chain

mod common;

use common::{Harness, int, key};
use proven_cache::{CacheError, Command, DataContainer, LockOwner, PrepareCommand, TransactionId};
use quickcheck_macros::quickcheck;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const FOREIGN: LockOwner = LockOwner(u64::MAX);

fn lock_foreign(harness: &Harness, name: &str) {
    harness
        .cache
        .lock_manager()
        .acquire(FOREIGN, &key(name), Duration::ZERO)
        .unwrap();
}

// ============================================================================
// Staging
// ============================================================================

#[test]
fn test_staging_is_idempotent() {
    let harness = Harness::new();
    harness.seed(&[("a", 1)]);

    let mut tx = harness.cache.begin();
    assert_eq!(tx.get("a").unwrap(), Some(int(1)));
    assert_eq!(tx.put("a", int(2)).unwrap(), Some(int(1)));
    assert_eq!(tx.get("a").unwrap(), Some(int(2)));
    tx.commit().unwrap();

    // Read once by the first staging, never again within the transaction
    assert_eq!(harness.container.get_count(&key("a")), 1);
    assert_eq!(harness.cache.get("a").unwrap(), Some(int(2)));
}

#[test]
fn test_put_after_remove_in_same_transaction() {
    let harness = Harness::new();
    harness.seed(&[("a", 1)]);

    let mut tx = harness.cache.begin();
    assert_eq!(tx.remove("a").unwrap(), Some(int(1)));
    assert_eq!(tx.get("a").unwrap(), None);
    tx.put("a", int(3)).unwrap();
    tx.commit().unwrap();

    assert_eq!(harness.cache.get("a").unwrap(), Some(int(3)));
}

#[test]
fn test_replace_requires_existing_entry() {
    let harness = Harness::new();

    let err = harness.cache.replace("missing", int(1)).unwrap_err();
    match err {
        CacheError::StagingFailure { key: k, .. } => assert_eq!(k, key("missing")),
        other => panic!("Expected staging failure, got {:?}", other),
    }
    assert_eq!(harness.cache.lock_manager().lock_count(), 0);
    assert!(harness.container.keys().is_empty());
}

// ============================================================================
// Locking
// ============================================================================

#[test]
fn test_lock_failure_on_nth_key_releases_earlier_keys() {
    let harness = Harness::new();
    lock_foreign(&harness, "c");

    let err = harness
        .cache
        .put_all([("a", int(1)), ("b", int(2)), ("c", int(3))])
        .unwrap_err();
    match err {
        CacheError::LockTimeout { key: k, holder, .. } => {
            assert_eq!(k, key("c"));
            assert_eq!(holder, Some(FOREIGN));
        }
        other => panic!("Expected lock timeout, got {:?}", other),
    }

    let locks = harness.cache.lock_manager();
    assert_eq!(locks.lock_count(), 1);
    assert!(!locks.is_locked(&key("a")));
    assert!(!locks.is_locked(&key("b")));
    assert_eq!(locks.holder(&key("c")), Some(FOREIGN));

    // Nothing reached the store
    assert!(harness.ownership.committed().is_empty());
    assert!(harness.container.keys().is_empty());
}

#[test]
fn test_contended_write_leaves_locks_of_others_alone() {
    let harness = Harness::new();
    lock_foreign(&harness, "a");

    assert!(harness.cache.put("a", int(1)).unwrap_err().is_lock_timeout());
    assert!(harness.cache.remove("a").unwrap_err().is_lock_timeout());

    // The failed invocations must not have released the foreign lock
    assert_eq!(harness.cache.lock_manager().holder(&key("a")), Some(FOREIGN));
    assert!(harness.cache.lock_manager().release(FOREIGN, &key("a")));
    harness.cache.put("a", int(1)).unwrap();
    assert_eq!(harness.cache.lock_manager().lock_count(), 0);
}

// ============================================================================
// Commit ordering
// ============================================================================

#[test]
fn test_commit_runs_in_reverse_staging_order() {
    let harness = Harness::new();

    let mut tx = harness.cache.begin();
    tx.put("A", int(1)).unwrap();
    tx.put("B", int(2)).unwrap();
    tx.put("C", int(3)).unwrap();
    tx.commit().unwrap();

    assert_eq!(harness.ownership.committed(), vec![key("C"), key("B"), key("A")]);
}

#[test]
fn test_unchanged_entries_are_not_committed() {
    let harness = Harness::new();
    harness.seed(&[("a", 1), ("b", 2)]);

    let mut tx = harness.cache.begin();
    tx.get("a").unwrap();
    tx.put("b", int(5)).unwrap();
    tx.get("c").unwrap();
    tx.commit().unwrap();

    assert_eq!(harness.ownership.committed(), vec![key("b")]);
}

// ============================================================================
// L1 invalidation
// ============================================================================

#[test]
fn test_invalidate_l1_drops_contended_keys() {
    let harness = Harness::new();
    harness.seed(&[("k1", 1), ("k2", 2), ("k3", 3)]);
    lock_foreign(&harness, "k2");

    harness.cache.invalidate_l1(["k1", "k2", "k3"]).unwrap();

    let seen = harness.recorder.seen();
    assert_eq!(
        seen,
        vec![Command::InvalidateL1 {
            keys: vec![key("k1"), key("k3")]
        }]
    );
    assert_eq!(harness.container.keys(), vec![key("k2")]);
    assert_eq!(harness.cache.lock_manager().lock_count(), 1);
}

#[test]
fn test_invalidate_l1_with_every_key_contended_is_a_no_op() {
    let harness = Harness::new();
    harness.seed(&[("k1", 1), ("k2", 2), ("k3", 3)]);
    for name in ["k1", "k2", "k3"] {
        lock_foreign(&harness, name);
    }

    assert_eq!(harness.cache.invalidate_l1(["k1", "k2", "k3"]), Ok(()));

    assert!(harness.recorder.seen().is_empty());
    assert_eq!(harness.container.len(), 3);
    assert!(harness.ownership.committed().is_empty());
}

#[test]
fn test_invalidate_skips_absent_and_contended_keys() {
    let harness = Harness::new();
    harness.seed(&[("a", 1), ("b", 2)]);
    lock_foreign(&harness, "b");

    harness
        .cache
        .invalidate(["a", "b", "missing"])
        .unwrap();

    assert_eq!(harness.container.keys(), vec![key("b")]);
    assert_eq!(harness.ownership.committed(), vec![key("a")]);
}

// ============================================================================
// Remote prepare replay
// ============================================================================

#[test]
fn test_put_all_replay_stages_only_owned_keys() {
    let harness = Harness::owning(&["K1"]);
    let entries = BTreeMap::from([(key("K1"), int(1)), (key("K2"), int(2))]);
    let prepare = PrepareCommand::new(
        TransactionId::new(),
        vec![Command::PutAll { entries }],
        true,
    );

    harness.cache.apply_remote_prepare(prepare).unwrap();

    assert_eq!(
        harness.recorder.modifications(),
        vec![Command::PutAll {
            entries: BTreeMap::from([(key("K1"), int(1))])
        }]
    );
    assert_eq!(harness.ownership.committed(), vec![key("K1")]);
    assert_eq!(harness.cache.get("K1").unwrap(), Some(int(1)));
    assert!(!harness.container.contains_key(&key("K2")));
}

#[test]
fn test_replayed_prepare_does_not_reapply_staged_keys() {
    let harness = Harness::new();
    let gtx = TransactionId::new();
    let prepare = PrepareCommand::new(
        gtx,
        vec![Command::Put {
            key: key("K1"),
            value: int(7),
            put_if_absent: false,
        }],
        false,
    );

    harness.cache.apply_remote_prepare(prepare.clone()).unwrap();
    harness.cache.apply_remote_prepare(prepare).unwrap();
    assert_eq!(harness.recorder.modifications().len(), 1);
    assert_eq!(harness.cache.pending_remote_transactions(), vec![gtx]);

    harness.cache.apply_remote_commit(gtx).unwrap();
    assert_eq!(harness.cache.get("K1").unwrap(), Some(int(7)));
    assert!(harness.cache.pending_remote_transactions().is_empty());
}

#[quickcheck]
fn prop_replay_reaches_each_key_once(keys: Vec<u8>, replays: u8) -> bool {
    let harness = Harness::new();
    let modifications: Vec<Command> = keys
        .iter()
        .map(|k| Command::Put {
            key: key(&format!("k{}", k)),
            value: int(i64::from(*k)),
            put_if_absent: false,
        })
        .collect();
    let prepare = PrepareCommand::new(TransactionId::new(), modifications, false);

    for _ in 0..=(replays % 4) {
        if harness.cache.apply_remote_prepare(prepare.clone()).is_err() {
            return false;
        }
    }

    let distinct: BTreeSet<u8> = keys.iter().copied().collect();
    harness.recorder.modifications().len() == distinct.len()
}

#[test]
fn test_clear_replay_commits_every_key_in_reverse_order() {
    let harness = Harness::new();
    harness.seed(&[("a", 1), ("b", 2), ("c", 3)]);
    let prepare = PrepareCommand::new(TransactionId::new(), vec![Command::Clear], true);

    harness.cache.apply_remote_prepare(prepare).unwrap();

    assert_eq!(harness.recorder.modifications(), vec![Command::Clear]);
    assert_eq!(
        harness.ownership.committed(),
        vec![key("c"), key("b"), key("a")]
    );
    assert!(harness.container.is_empty());
}

#[test]
fn test_clear_of_empty_store_replays_nothing() {
    let harness = Harness::new();
    let prepare = PrepareCommand::new(TransactionId::new(), vec![Command::Clear], true);

    harness.cache.apply_remote_prepare(prepare).unwrap();
    assert!(harness.recorder.modifications().is_empty());
}
