//! End-to-end tests for the hybrid key-value store

use parking_lot::Mutex;
use slabkv::error::Error;
use slabkv::{HybridStore, Pool, SlotIndex, StoreConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const WORKERS: usize = 8;

fn small_config() -> StoreConfig {
    StoreConfig::default()
        .with_capacity(1024 * 1024)
        .with_slot_size(64)
        .with_segment_slots(8)
        .with_scan_concurrency(4)
}

#[test]
fn test_slot_reuse_walkthrough() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = small_config();

    {
        let store: HybridStore<u64, u64> =
            HybridStore::create(dir.path(), &config).expect("Failed to create store");
        assert_eq!(store.insert(5, 10).unwrap(), SlotIndex(0));
        assert_eq!(store.insert(15, 20).unwrap(), SlotIndex(1));
        assert_eq!(store.get(&5).unwrap(), 10);
        assert_eq!(store.get(&15).unwrap(), 20);
        store.close().expect("Failed to close store");
    }

    let store: HybridStore<u64, u64> =
        HybridStore::open(dir.path(), &config).expect("Failed to reopen store");
    assert_eq!(store.get(&5).unwrap(), 10);
    assert_eq!(store.get(&15).unwrap(), 20);

    store.remove(&5).unwrap();
    store.remove(&15).unwrap();
    assert!(store.is_empty());

    // Freed slots come back last-freed first
    assert_eq!(store.insert(5, 10).unwrap(), SlotIndex(1));
    assert_eq!(store.insert(15, 20).unwrap(), SlotIndex(0));
    assert_eq!(store.insert(20, 25).unwrap(), SlotIndex(2));

    let report = store.verify().expect("Store should verify");
    assert_eq!((report.len, report.occupied, report.free), (3, 3, 0));
}

#[test]
fn test_reinserted_key_takes_freed_slot() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store: HybridStore<String, String> =
        HybridStore::create(dir.path(), &small_config()).unwrap();

    let first = store.insert("k1".to_string(), "v1".to_string()).unwrap();
    store.insert("k2".to_string(), "v2".to_string()).unwrap();
    store.remove(&"k1".to_string()).unwrap();

    let reused = store.insert("k3".to_string(), "v3".to_string()).unwrap();
    assert_eq!(reused, first);
    assert_eq!(store.get(&"k3".to_string()).unwrap(), "v3");
    assert_eq!(store.keys(), vec!["k3".to_string(), "k2".to_string()]);
}

#[test]
fn test_persistence_across_many_reopens() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = small_config();

    for round in 0..3u64 {
        let store: HybridStore<u64, String> =
            HybridStore::open_or_create(dir.path(), &config).unwrap();
        for i in 0..20 {
            store.insert(round * 100 + i, format!("r{}-{}", round, i)).unwrap();
        }
        for i in (0..20).step_by(2) {
            store.remove(&(round * 100 + i)).unwrap();
        }
        store.close().unwrap();
    }

    let store: HybridStore<u64, String> = HybridStore::open(dir.path(), &config).unwrap();
    assert_eq!(store.len(), 30);
    assert_eq!(store.get(&201).unwrap(), "r2-1");
    assert!(matches!(store.get(&200), Err(Error::NotFound(_))));

    // Later rounds refill the slots freed by earlier ones
    let report = store.verify().unwrap();
    assert_eq!(report.occupied, 30);
    assert_eq!(report.len, 40);
    assert_eq!(report.free, 10);
}

#[test]
fn test_rebuild_is_idempotent() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store: HybridStore<u64, u64> = HybridStore::create(dir.path(), &small_config()).unwrap();
    for i in 0..64 {
        store.insert(i, i * i).unwrap();
    }
    for i in (0..64).step_by(7) {
        store.remove(&i).unwrap();
    }

    store.rebuild_index().unwrap();
    let first = store.index_entries();
    store.rebuild_index().unwrap();
    assert_eq!(store.index_entries(), first);
    assert_eq!(first.len(), store.len());
}

#[test]
fn test_scan_concurrency_matches_sequential() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store: HybridStore<u64, String> =
        HybridStore::create(dir.path(), &small_config()).unwrap();
    for i in 0..100 {
        store.insert(i, format!("value-{}", i)).unwrap();
    }
    for i in (0..100).step_by(9) {
        store.remove(&i).unwrap();
    }

    let collect = |concurrency: usize| {
        let seen = Mutex::new(Vec::new());
        store
            .scan(concurrency, |idx, key, value| {
                seen.lock().push((idx, *key, value.clone()));
                Ok(())
            })
            .expect("Scan should succeed");
        let mut seen = seen.into_inner();
        seen.sort();
        seen
    };

    let sequential = collect(1);
    assert_eq!(sequential.len(), store.len());
    for concurrency in [2, 3, 8, 200] {
        assert_eq!(collect(concurrency), sequential, "concurrency {}", concurrency);
    }
}

#[test]
fn test_capacity_exhaustion_leaves_store_usable() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    // One header page plus eight 512-byte segments: 64 slots
    let config = small_config().with_capacity(8 * 1024);
    let store: HybridStore<u64, u64> = HybridStore::create(dir.path(), &config).unwrap();
    assert_eq!(store.stats().unwrap().slab.capacity_slots, 64);

    for i in 0..64 {
        store.insert(i, i).unwrap();
    }
    assert!(matches!(
        store.insert(64, 64),
        Err(Error::CapacityExceeded(_))
    ));
    assert!(!store.contains_key(&64));

    // Freed slots are still reusable at capacity
    store.remove(&3).unwrap();
    assert_eq!(store.insert(64, 64).unwrap(), SlotIndex(3));
    store.verify().unwrap();
}

#[test]
fn test_payload_too_large_changes_nothing() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store: HybridStore<u64, String> =
        HybridStore::create(dir.path(), &small_config()).unwrap();
    store.insert(1, "small".to_string()).unwrap();
    store.remove(&1).unwrap();

    let result = store.insert(2, "x".repeat(100));
    assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
    assert!(!store.contains_key(&2));

    let report = store.verify().unwrap();
    assert_eq!((report.len, report.occupied, report.free), (1, 0, 1));

    store.insert(3, "fits".to_string()).unwrap();
    assert!(matches!(
        store.update(&3, "y".repeat(100)),
        Err(Error::PayloadTooLarge { .. })
    ));
    assert_eq!(store.get(&3).unwrap(), "fits");
}

#[test]
fn test_open_rejects_foreign_pool() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = Pool::create(dir.path(), "other", 64 * 1024).unwrap();
    pool.close().unwrap();

    let result = HybridStore::<u64, u64>::open(dir.path(), &small_config());
    assert!(matches!(result, Err(Error::Corrupt(_))));

    let missing = HybridStore::<u64, u64>::open(dir.path().join("absent"), &small_config());
    assert!(matches!(missing, Err(Error::NotFound(_))));
}

#[test]
fn test_failed_create_leaves_path_reusable() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    // Default geometry needs 256 KiB for its first segment
    let too_small = StoreConfig::default().with_capacity(64 * 1024);

    let result = HybridStore::<u64, u64>::create(dir.path(), &too_small);
    assert!(matches!(result, Err(Error::OutOfSpace(_))));
    assert!(!Pool::exists(dir.path()));

    let store: HybridStore<u64, u64> =
        HybridStore::create(dir.path(), &small_config()).expect("Failed to create store");
    store.insert(1, 2).unwrap();
    store.close().expect("Failed to close store");

    let store: HybridStore<u64, u64> =
        HybridStore::open_or_create(dir.path(), &small_config()).expect("Failed to open store");
    assert_eq!(store.get(&1).unwrap(), 2);
}

#[test]
fn test_open_or_create_after_failed_create() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let too_small = StoreConfig::default().with_capacity(64 * 1024);
    assert!(HybridStore::<u64, u64>::open_or_create(dir.path(), &too_small).is_err());

    let store: HybridStore<u64, u64> =
        HybridStore::open_or_create(dir.path(), &small_config()).expect("Failed to create store");
    assert!(store.is_empty());
    store.verify().unwrap();
}

#[test]
fn test_concurrent_remove_of_same_key() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store: Arc<HybridStore<u64, u64>> =
        Arc::new(HybridStore::create(dir.path(), &small_config()).unwrap());

    for key in 0..16 {
        store.insert(key, key * 10).unwrap();
        let removed = AtomicUsize::new(0);
        let missing = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..WORKERS {
                let store = Arc::clone(&store);
                let (removed, missing) = (&removed, &missing);
                s.spawn(move || match store.remove(&key) {
                    Ok(()) => {
                        removed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(Error::NotFound(_)) => {
                        missing.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("unexpected remove error: {:?}", e),
                });
            }
        });

        assert_eq!(removed.load(Ordering::SeqCst), 1, "key {}", key);
        assert_eq!(missing.load(Ordering::SeqCst), WORKERS - 1);
        assert!(!store.contains_key(&key));
    }

    // Every removed slot went onto the free list exactly once
    let report = store.verify().unwrap();
    assert_eq!((report.len, report.occupied, report.free), (1, 0, 1));
}

#[test]
fn test_concurrent_insert_of_same_key() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store: Arc<HybridStore<u64, u64>> =
        Arc::new(HybridStore::create(dir.path(), &small_config()).unwrap());
    let winners = Mutex::new(Vec::new());

    thread::scope(|s| {
        for worker in 0..WORKERS as u64 {
            let store = Arc::clone(&store);
            let winners = &winners;
            s.spawn(move || match store.insert(7, worker) {
                Ok(_) => winners.lock().push(worker),
                Err(Error::AlreadyExists(_)) => {}
                Err(e) => panic!("unexpected insert error: {:?}", e),
            });
        }
    });

    let winners = winners.into_inner();
    assert_eq!(winners.len(), 1);
    assert_eq!(store.get(&7).unwrap(), winners[0]);
    assert_eq!(store.verify().unwrap().occupied, 1);
}

#[test]
fn test_concurrent_inserts_of_distinct_keys() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store: Arc<HybridStore<u64, u64>> =
        Arc::new(HybridStore::create(dir.path(), &small_config()).unwrap());
    let per_worker = 25u64;

    thread::scope(|s| {
        for worker in 0..WORKERS as u64 {
            let store = Arc::clone(&store);
            s.spawn(move || {
                for i in 0..per_worker {
                    let key = worker * 1000 + i;
                    store.insert(key, key + 1).unwrap();
                    // Churn the free list alongside the other workers
                    if i % 5 == 4 {
                        store.remove(&key).unwrap();
                    }
                }
            });
        }
    });

    let expected = WORKERS * (per_worker as usize - per_worker as usize / 5);
    assert_eq!(store.len(), expected);

    let report = store.verify().expect("Store should verify");
    assert_eq!(report.occupied, expected as u64);
    assert_eq!(report.len, report.occupied + report.free);

    let mut slots: Vec<SlotIndex> = store.index_entries().into_iter().map(|(_, idx)| idx).collect();
    slots.sort();
    slots.dedup();
    assert_eq!(slots.len(), expected);

    for (key, _) in store.index_entries() {
        assert_eq!(store.get(&key).unwrap(), key + 1);
    }
}
