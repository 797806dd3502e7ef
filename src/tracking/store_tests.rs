//! Tracking-store tests, including the adversarial crash-recovery cases:
//! a kill between the two archive writes must leave the pair recoverable to
//! either the pre- or post-archive state, never a mixed one.

use super::*;
use crate::models::{Chain, TokenRef};
use std::path::Path;

fn signal(token: &str, number: u32) -> SignalOutcome {
    let token_ref = TokenRef::from_symbol(Chain::Evm, token);
    SignalOutcome::new(
        "chan-1",
        "Alpha Calls",
        token_ref,
        number,
        Vec::new(),
        100 + number as i64,
        1_700_000_000,
        50.0,
    )
}

fn store_in(dir: &Path) -> TrackingStore {
    TrackingStore::new(
        dir.join("active_tracking.json"),
        dir.join("completed_history.json"),
    )
}

#[test]
fn test_classify_mention_fresh_then_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());

    let fresh = store.classify_mention("ETH");
    assert!(!fresh.is_duplicate);
    assert_eq!(fresh.next_signal_number, 1);
    assert!(fresh.previous_signal_ids.is_empty());

    store.add_active(signal("ETH", 1)).unwrap();

    let dup = store.classify_mention("ETH");
    assert!(dup.is_duplicate);
}

#[test]
fn test_signal_numbering_across_rementions() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());

    let first = signal("ETH", 1);
    let first_id = first.signal_id.clone();
    store.add_active(first).unwrap();
    store.archive("ETH").unwrap();

    // Fresh-start re-monitoring: next mention opens signal number 2 and
    // carries the predecessor's id.
    let class = store.classify_mention("ETH");
    assert!(!class.is_duplicate);
    assert_eq!(class.next_signal_number, 2);
    assert_eq!(class.previous_signal_ids, vec![first_id]);

    store.add_active(signal("ETH", 2)).unwrap();
    store.archive("ETH").unwrap();

    let numbers: Vec<u32> = store
        .completed_for("ETH")
        .iter()
        .map(|s| s.signal_number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[test]
fn test_add_active_rejects_second_for_same_token() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());

    store.add_active(signal("ETH", 1)).unwrap();
    let err = store.add_active(signal("ETH", 2)).unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)));
    assert_eq!(store.active_signals().len(), 1);
}

#[test]
fn test_update_active_checks_signal_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());

    let mut tracked = signal("ETH", 1);
    store.add_active(tracked.clone()).unwrap();

    tracked.current_price = 75.0;
    store.update_active(&tracked).unwrap();
    assert_eq!(store.get_active("ETH").unwrap().current_price, 75.0);

    let imposter = signal("ETH", 1);
    let err = store.update_active(&imposter).unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)));
}

#[test]
fn test_archive_exclusivity_and_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());

    store.add_active(signal("ETH", 1)).unwrap();
    store.add_active(signal("PEPE", 1)).unwrap();
    store.archive("ETH").unwrap();

    // Every signal id lives in exactly one file.
    let snapshot = store.snapshot();
    let active_ids: Vec<&str> = snapshot
        .active
        .values()
        .map(|s| s.signal_id.as_str())
        .collect();
    let completed_ids: Vec<&str> = snapshot
        .completed_signals()
        .map(|s| s.signal_id.as_str())
        .collect();
    assert_eq!(active_ids.len(), 1);
    assert_eq!(completed_ids.len(), 1);
    assert!(active_ids.iter().all(|id| !completed_ids.contains(id)));

    // load(snapshot(state)) == state
    let reloaded = TrackingStore::open(
        dir.path().join("active_tracking.json"),
        dir.path().join("completed_history.json"),
    )
    .unwrap();
    let reloaded_snapshot = reloaded.snapshot();
    assert_eq!(reloaded_snapshot.active, snapshot.active);
    assert_eq!(reloaded_snapshot.completed, snapshot.completed);
}

#[test]
fn test_archive_without_active_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    assert!(matches!(
        store.archive("ETH").unwrap_err(),
        StoreError::InvariantViolation(_)
    ));
}

#[test]
fn test_version_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("active_tracking.json"),
        r#"{"version": 42, "signals": {}}"#,
    )
    .unwrap();

    let err = TrackingStore::open(
        dir.path().join("active_tracking.json"),
        dir.path().join("completed_history.json"),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionMismatch {
            found: 42,
            expected: TRACKING_STORE_VERSION
        }
    ));
}

#[test]
fn test_crash_between_archive_writes_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    store.add_active(signal("ETH", 1)).unwrap();
    let pre_archive = store.snapshot();

    // Simulate the kill: sidecar written, active file rewritten to empty,
    // completed file never written.
    let backup_body =
        std::fs::read_to_string(dir.path().join("active_tracking.json")).unwrap();
    std::fs::write(dir.path().join("active_tracking.json.bak"), backup_body).unwrap();
    std::fs::write(
        dir.path().join("active_tracking.json"),
        r#"{"version": 1, "signals": {}}"#,
    )
    .unwrap();

    let recovered = TrackingStore::open(
        dir.path().join("active_tracking.json"),
        dir.path().join("completed_history.json"),
    )
    .unwrap();

    let snapshot = recovered.snapshot();
    assert_eq!(snapshot.active, pre_archive.active);
    assert!(snapshot.completed.is_empty());
    assert!(!dir.path().join("active_tracking.json.bak").exists());
}

#[test]
fn test_crash_after_both_writes_keeps_post_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    store.add_active(signal("ETH", 1)).unwrap();

    // Plant the sidecar as if the kill happened after the completed write
    // but before sidecar cleanup, then finish the archive for real.
    let backup_body =
        std::fs::read_to_string(dir.path().join("active_tracking.json")).unwrap();
    store.archive("ETH").unwrap();
    std::fs::write(dir.path().join("active_tracking.json.bak"), backup_body).unwrap();

    let recovered = TrackingStore::open(
        dir.path().join("active_tracking.json"),
        dir.path().join("completed_history.json"),
    )
    .unwrap();

    let snapshot = recovered.snapshot();
    assert!(snapshot.active.is_empty());
    assert_eq!(snapshot.completed_signals().count(), 1);
    assert!(!dir.path().join("active_tracking.json.bak").exists());
}

#[test]
fn test_shared_signal_id_repaired_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    store.add_active(signal("ETH", 1)).unwrap();
    store.archive("ETH").unwrap();

    // Corrupt: copy the completed signal back into the active file.
    let completed = store.completed_for("ETH").pop().unwrap();
    let corrupt = ActiveFile {
        version: TRACKING_STORE_VERSION,
        signals: HashMap::from([("ETH".to_string(), completed)]),
    };
    atomic_write_json(&dir.path().join("active_tracking.json"), &corrupt).unwrap();

    let recovered = TrackingStore::open(
        dir.path().join("active_tracking.json"),
        dir.path().join("completed_history.json"),
    )
    .unwrap();
    let snapshot = recovered.snapshot();
    assert!(snapshot.active.is_empty());
    assert_eq!(snapshot.completed_signals().count(), 1);
}

#[test]
fn test_completed_order_restored_on_load() {
    let dir = tempfile::tempdir().unwrap();

    let mut newer = signal("ETH", 2);
    newer.status = SignalStatus::Completed;
    let mut older = signal("ETH", 1);
    older.status = SignalStatus::Completed;

    let file = CompletedFile {
        version: TRACKING_STORE_VERSION,
        signals: HashMap::from([("ETH".to_string(), vec![newer, older])]),
    };
    atomic_write_json(&dir.path().join("completed_history.json"), &file).unwrap();

    let store = TrackingStore::open(
        dir.path().join("active_tracking.json"),
        dir.path().join("completed_history.json"),
    )
    .unwrap();

    let numbers: Vec<u32> = store
        .completed_for("ETH")
        .iter()
        .map(|s| s.signal_number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}
