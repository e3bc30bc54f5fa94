//! Hybrid key-value store
//!
//! Combines a durable SlabAllocator with a volatile key index. Values live in
//! slots of the pool; the key → slot mapping lives in memory and is rebuilt
//! from the slots on open.
//!
//! Every operation runs its whole lookup-then-mutate sequence under one lock,
//! and the index changes only after the durable write has committed.

use super::index::VolatileIndex;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::storage::pool::{FailPoint, Pool};
use crate::storage::slab::arena::init_root;
use crate::storage::slab::{SlabAllocator, SlabReport, SlabStats, SlotIndex, SlotLayout};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;
use std::path::Path;
use tracing::{debug, info, warn};

/// Layout name stamped into pools created by the store
pub const LAYOUT: &str = "slabkv";

/// Payload of an occupied slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Entry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

struct Inner<K, V> {
    slab: SlabAllocator<Entry<K, V>>,
    index: VolatileIndex<K>,
}

/// Durable key-value store with an in-memory index
pub struct HybridStore<K, V> {
    inner: Mutex<Inner<K, V>>,
    config: StoreConfig,
}

impl<K, V> HybridStore<K, V>
where
    K: Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send,
    V: Serialize + DeserializeOwned,
{
    /// Create a new store at `path`
    ///
    /// Nothing is left at `path` if creation fails.
    pub fn create<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let layout = SlotLayout::new(config.slot_size, config.segment_slots)?;
        layout.check_fits(config.capacity)?;

        let pool = Pool::create_with(path.as_ref(), LAYOUT, config.capacity, |pool| {
            init_root(pool, layout)
        })?;
        let slab = SlabAllocator::open(pool)?;

        info!(path = ?path.as_ref(), slot_size = config.slot_size, "Created hybrid store");

        Ok(Self {
            inner: Mutex::new(Inner {
                slab,
                index: VolatileIndex::new(),
            }),
            config: config.clone(),
        })
    }

    /// Open an existing store, recover its pool and rebuild the index
    ///
    /// The slot geometry stored in the pool takes precedence over `config`.
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = Pool::open(path.as_ref(), LAYOUT)?;
        let slab: SlabAllocator<Entry<K, V>> = SlabAllocator::open(pool)?;

        let arena = slab.arena();
        if arena.slot_size() != config.slot_size || arena.segment_slots() != config.segment_slots
        {
            warn!(
                stored_slot_size = arena.slot_size(),
                stored_segment_slots = arena.segment_slots(),
                config_slot_size = config.slot_size,
                config_segment_slots = config.segment_slots,
                "Pool geometry differs from config, using the stored geometry"
            );
        }

        let index = VolatileIndex::rebuild(&slab, config.scan_concurrency)?;

        info!(path = ?path.as_ref(), keys = index.len(), "Opened hybrid store");

        Ok(Self {
            inner: Mutex::new(Inner { slab, index }),
            config: config.clone(),
        })
    }

    /// Open the store at `path`, creating it if no pool exists there
    pub fn open_or_create<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        if Pool::exists(path.as_ref()) {
            Self::open(path, config)
        } else {
            Self::create(path, config)
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Insert a new key, returning the slot it landed in
    pub fn insert(&self, key: K, value: V) -> Result<SlotIndex> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("key {:?}", key)));
        }

        let entry = Entry::new(key, value);
        let idx = inner.slab.insert(&entry)?;
        inner.index.put(entry.key, idx)?;

        debug!(slot = %idx, "Inserted key");
        Ok(idx)
    }

    /// Remove a key and release its slot
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = inner
            .index
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("key {:?}", key)))?;

        inner.slab.remove(idx)?;
        inner.index.remove(key);

        debug!(slot = %idx, "Removed key");
        Ok(())
    }

    /// Read the value stored under `key`
    pub fn get(&self, key: &K) -> Result<V> {
        let inner = self.inner.lock();
        let idx = inner
            .index
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("key {:?}", key)))?;

        let entry = inner.slab.get(idx)?;
        if entry.key != *key {
            return Err(Error::Corrupt(format!(
                "{} holds key {:?}, index expected {:?}",
                idx, entry.key, key
            )));
        }
        Ok(entry.value)
    }

    /// Replace the value of an existing key in place
    pub fn update(&self, key: &K, value: V) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = inner
            .index
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("key {:?}", key)))?;

        inner.slab.update(idx, &Entry::new(key.clone(), value))?;
        debug!(slot = %idx, "Updated key");
        Ok(())
    }

    /// Visit every stored pair, `concurrency` partitions at a time
    ///
    /// The store lock is held until every callback has returned. A callback
    /// that calls back into the same store deadlocks.
    pub fn scan<F>(&self, concurrency: usize, callback: F) -> Result<()>
    where
        F: Fn(SlotIndex, &K, &V) -> Result<()> + Sync,
    {
        let inner = self.inner.lock();
        inner
            .slab
            .scan(concurrency, |idx, entry| callback(idx, &entry.key, &entry.value))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    /// Slot currently holding `key`
    pub fn slot_of(&self, key: &K) -> Option<SlotIndex> {
        self.inner.lock().index.get(key)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Keys in slot order
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().index.keys()
    }

    pub fn index_entries(&self) -> Vec<(K, SlotIndex)> {
        self.inner.lock().index.entries()
    }

    /// Discard the index and rebuild it from the slab
    pub fn rebuild_index(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.index = VolatileIndex::rebuild(&inner.slab, self.config.scan_concurrency)?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.lock();
        Ok(StoreStats {
            keys: inner.index.len(),
            slab: inner.slab.stats()?,
        })
    }

    /// Check the slab structure and that the index agrees with it
    pub fn verify(&self) -> Result<SlabReport> {
        let inner = self.inner.lock();
        let report = inner.slab.verify()?;

        if report.occupied != inner.index.len() as u64 {
            return Err(Error::Corrupt(format!(
                "index holds {} keys, slab holds {} occupied slots",
                inner.index.len(),
                report.occupied
            )));
        }
        for (key, idx) in inner.index.entries() {
            let entry = inner.slab.get(idx)?;
            if entry.key != key {
                return Err(Error::Corrupt(format!(
                    "index maps {:?} to {}, which holds {:?}",
                    key, idx, entry.key
                )));
            }
        }

        Ok(report)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().slab.flush()
    }

    /// Arm a crash simulation for the next commit
    pub fn set_fail_point(&self, fail_point: Option<FailPoint>) {
        self.inner.lock().slab.set_fail_point(fail_point);
    }

    /// Flush and release the store
    pub fn close(self) -> Result<()> {
        let inner = self.inner.into_inner();
        info!(keys = inner.index.len(), "Closing hybrid store");
        inner.slab.close()
    }
}

/// Statistics for the hybrid store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub keys: usize,
    pub slab: SlabStats,
}
