//! Simulated crashes in the middle of store transactions
//!
//! Each test arms a fail point, runs one operation, abandons the handle and
//! reopens the store. The slot must come back entirely in its old state or
//! entirely in its new one.

use slabkv::error::Error;
use slabkv::{FailPoint, HybridStore, SlotIndex, StoreConfig};
use std::path::Path;

const FAIL_POINTS: [FailPoint; 3] = [
    FailPoint::TornJournal,
    FailPoint::AfterJournalSync,
    FailPoint::MidApply,
];

fn config() -> StoreConfig {
    StoreConfig::default()
        .with_capacity(256 * 1024)
        .with_slot_size(64)
        .with_segment_slots(4)
        .with_scan_concurrency(2)
}

/// Whether the journal reached disk in full before the simulated crash
fn survives(fail_point: FailPoint) -> bool {
    fail_point != FailPoint::TornJournal
}

fn seeded_store(path: &Path) -> HybridStore<u64, u64> {
    let store = HybridStore::create(path, &config()).expect("Failed to create store");
    store.insert(5, 10).unwrap();
    store.insert(15, 20).unwrap();
    store.insert(25, 30).unwrap();
    store
}

#[test]
fn test_crash_during_remove() {
    for fail_point in FAIL_POINTS {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = seeded_store(dir.path());
        store.remove(&25).unwrap();

        store.set_fail_point(Some(fail_point));
        let result = store.remove(&15);
        assert!(
            matches!(result, Err(Error::TransactionAborted(_))),
            "{:?}: {:?}",
            fail_point,
            result
        );
        // Index untouched because nothing committed in this handle
        assert!(store.contains_key(&15));
        // The handle is dead until reopened
        assert!(matches!(
            store.insert(35, 40),
            Err(Error::TransactionAborted(_))
        ));
        drop(store);

        let store: HybridStore<u64, u64> =
            HybridStore::open(dir.path(), &config()).expect("Failed to reopen store");
        let report = store.verify().expect("Recovered store should verify");

        if survives(fail_point) {
            assert!(!store.contains_key(&15), "{:?}", fail_point);
            assert_eq!(report.free, 2);
            // Freed last, reused first
            assert_eq!(store.insert(35, 40).unwrap(), SlotIndex(1));
        } else {
            assert_eq!(store.get(&15).unwrap(), 20, "{:?}", fail_point);
            assert_eq!(report.free, 1);
            assert_eq!(store.insert(35, 40).unwrap(), SlotIndex(2));
        }
        assert_eq!(store.get(&5).unwrap(), 10);
        store.verify().unwrap();
    }
}

#[test]
fn test_crash_during_reusing_insert() {
    for fail_point in FAIL_POINTS {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = seeded_store(dir.path());
        store.remove(&5).unwrap();
        store.remove(&15).unwrap();

        store.set_fail_point(Some(fail_point));
        let result = store.insert(99, 100);
        assert!(matches!(result, Err(Error::TransactionAborted(_))));
        assert!(!store.contains_key(&99));
        drop(store);

        let store: HybridStore<u64, u64> = HybridStore::open(dir.path(), &config()).unwrap();
        let report = store.verify().expect("Recovered store should verify");

        if survives(fail_point) {
            assert_eq!(store.slot_of(&99), Some(SlotIndex(1)), "{:?}", fail_point);
            assert_eq!(store.get(&99).unwrap(), 100);
            assert_eq!(report.free, 1);
            assert_eq!(store.insert(7, 8).unwrap(), SlotIndex(0));
        } else {
            assert!(!store.contains_key(&99), "{:?}", fail_point);
            assert_eq!(report.free, 2);
            assert_eq!(store.insert(7, 8).unwrap(), SlotIndex(1));
        }
        assert_eq!(store.get(&25).unwrap(), 30);
    }
}

#[test]
fn test_crash_during_append() {
    for fail_point in FAIL_POINTS {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = seeded_store(dir.path());

        // Slot 3 fills the first segment; slot 4 needs a new one
        store.insert(35, 40).unwrap();
        store.set_fail_point(Some(fail_point));
        assert!(store.insert(45, 50).is_err());
        drop(store);

        let store: HybridStore<u64, u64> = HybridStore::open(dir.path(), &config()).unwrap();
        let report = store.verify().unwrap();
        if survives(fail_point) {
            assert_eq!(report.len, 5);
            assert_eq!(store.get(&45).unwrap(), 50);
        } else {
            assert_eq!(report.len, 4);
            assert!(!store.contains_key(&45));
            assert_eq!(store.insert(45, 50).unwrap(), SlotIndex(4));
        }
    }
}

#[test]
fn test_crash_during_update() {
    for fail_point in FAIL_POINTS {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = seeded_store(dir.path());

        store.set_fail_point(Some(fail_point));
        assert!(store.update(&15, 2000).is_err());
        drop(store);

        let store: HybridStore<u64, u64> = HybridStore::open(dir.path(), &config()).unwrap();
        let expected = if survives(fail_point) { 2000 } else { 20 };
        assert_eq!(store.get(&15).unwrap(), expected, "{:?}", fail_point);
    }
}

#[test]
fn test_clean_close_leaves_empty_journal() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = seeded_store(dir.path());
    store.remove(&5).unwrap();
    store.flush().unwrap();
    store.close().unwrap();

    let journal = std::fs::metadata(dir.path().join("pool.journal")).unwrap();
    assert_eq!(journal.len(), 0);

    let store: HybridStore<u64, u64> = HybridStore::open(dir.path(), &config()).unwrap();
    assert_eq!(store.keys(), vec![15, 25]);
}
