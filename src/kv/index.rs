//! Volatile key index
//!
//! Maps keys to the slots holding them. The index lives only in memory and is
//! rebuilt from the slab on every open: the slab is the source of truth.

use super::store::Entry;
use crate::error::{Error, Result};
use crate::storage::slab::{SlabAllocator, SlotIndex};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Instant;
use tracing::info;

/// In-memory key → slot mapping
#[derive(Debug, Clone)]
pub struct VolatileIndex<K> {
    slots: HashMap<K, SlotIndex>,
}

impl<K: Eq + Hash> PartialEq for VolatileIndex<K> {
    fn eq(&self, other: &Self) -> bool {
        self.slots == other.slots
    }
}

impl<K: Eq + Hash> Eq for VolatileIndex<K> {}

impl<K> Default for VolatileIndex<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<K> VolatileIndex<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the index from every occupied slot of `slab`
    ///
    /// Slots are decoded in parallel; inserts into the map are serialized by
    /// one lock. Two slots holding the same key fail with `Corrupt`.
    pub fn rebuild<V>(slab: &SlabAllocator<Entry<K, V>>, concurrency: usize) -> Result<Self>
    where
        K: Serialize + DeserializeOwned + Send,
        V: Serialize + DeserializeOwned,
    {
        let start = Instant::now();
        let slots = Mutex::new(HashMap::new());

        slab.scan(concurrency, |idx, entry| {
            let mut slots = slots.lock();
            match slots.insert(entry.key.clone(), idx) {
                None => Ok(()),
                Some(other) => Err(Error::Corrupt(format!(
                    "key {:?} is stored in both {} and {}",
                    entry.key, other, idx
                ))),
            }
        })
        .map_err(|e| match e {
            Error::ScanFailed { first, .. } => *first,
            other => other,
        })?;

        let index = Self {
            slots: slots.into_inner(),
        };
        info!(
            keys = index.len(),
            slots = slab.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Rebuilt volatile index"
        );
        Ok(index)
    }

    pub fn get(&self, key: &K) -> Option<SlotIndex> {
        self.slots.get(key).copied()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Map `key` to `idx`; an existing mapping is left untouched
    pub fn put(&mut self, key: K, idx: SlotIndex) -> Result<()> {
        if let Some(existing) = self.slots.get(&key) {
            return Err(Error::DuplicateKey(format!(
                "{:?} already maps to {}",
                key, existing
            )));
        }
        self.slots.insert(key, idx);
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Option<SlotIndex> {
        self.slots.remove(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Keys in slot order
    pub fn keys(&self) -> Vec<K> {
        self.entries().into_iter().map(|(key, _)| key).collect()
    }

    /// Snapshot of all mappings in slot order
    pub fn entries(&self) -> Vec<(K, SlotIndex)> {
        let mut entries: Vec<_> = self
            .slots
            .iter()
            .map(|(key, idx)| (key.clone(), *idx))
            .collect();
        entries.sort_by_key(|(_, idx)| *idx);
        entries
    }
}
