//! Slab allocator implementation

use super::arena::{Arena, SlotLayout};
use super::free_list;
use super::slot::{SlotIndex, SlotState};
use crate::error::{Error, Result};
use crate::storage::pool::{FailPoint, Pool};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info};

/// Slab allocator over a durable arena
///
/// Freed slots are reused in LIFO order through the intrusive free list
/// before the arena grows.
pub struct SlabAllocator<T> {
    arena: Arena<T>,
}

impl<T> SlabAllocator<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a slab allocator in a freshly created pool
    ///
    /// # Arguments
    /// * `pool` - Empty pool to initialize
    /// * `slot_size` - Bytes per slot, header included
    /// * `segment_slots` - Slots added each time the arena grows
    pub fn create(pool: Pool, slot_size: usize, segment_slots: u32) -> Result<Self> {
        let layout = SlotLayout::new(slot_size, segment_slots)?;
        let arena = Arena::create(pool, layout)?;
        Ok(Self { arena })
    }

    /// Open the slab allocator stored in `pool`
    pub fn open(pool: Pool) -> Result<Self> {
        let arena = Arena::open(pool)?;
        info!(
            slots = arena.len(),
            slot_size = arena.slot_size(),
            "Opened slab allocator"
        );
        Ok(Self { arena })
    }

    pub fn arena(&self) -> &Arena<T> {
        &self.arena
    }

    /// Number of slots in the arena (occupied + vacant)
    pub fn len(&self) -> u64 {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Store `value` in a free slot, or a new one if none is free
    pub fn insert(&mut self, value: &T) -> Result<SlotIndex> {
        let Some(idx) = self.arena.free_head() else {
            return self.arena.append(value);
        };

        // The slot is vacant, so the payload is invisible until the tag flips
        self.arena.persist_payload(idx, value)?;
        let reused = self.arena.run(|atx| {
            let popped = free_list::pop_free(atx)?;
            atx.mark_occupied(popped)?;
            Ok(popped)
        })?;

        debug!(slot = %reused, "Reused free slot");
        Ok(reused)
    }

    /// Release the slot at `idx` onto the free list
    pub fn remove(&mut self, idx: SlotIndex) -> Result<()> {
        self.arena.run(|atx| {
            if atx.slot_state(idx)? == SlotState::Vacant {
                return Err(Error::NotFound(format!("{} is already free", idx)));
            }
            free_list::push_free(atx, idx)
        })?;

        debug!(slot = %idx, "Freed slot");
        Ok(())
    }

    /// Read the value stored at `idx`
    pub fn get(&self, idx: SlotIndex) -> Result<T> {
        self.arena
            .slot_at(idx)?
            .into_payload()
            .ok_or_else(|| Error::NotFound(format!("{} is vacant", idx)))
    }

    /// Replace the value stored at `idx` in place
    pub fn update(&mut self, idx: SlotIndex, value: &T) -> Result<()> {
        self.arena.run(|atx| atx.update_payload(idx, value))?;
        debug!(slot = %idx, "Updated slot");
        Ok(())
    }

    /// Visit every occupied slot, `concurrency` partitions at a time.
    ///
    /// Each partition is a contiguous index range visited in ascending order
    /// on its own worker. All partitions run to completion; a partition stops
    /// at its first error and the failures are reported together.
    pub fn scan<F>(&self, concurrency: usize, callback: F) -> Result<()>
    where
        F: Fn(SlotIndex, &T) -> Result<()> + Sync,
    {
        if concurrency == 0 {
            return Err(Error::InvalidArgument(
                "scan concurrency must be at least 1".to_string(),
            ));
        }
        let ranges = partition(self.len(), concurrency);
        if ranges.is_empty() {
            return Ok(());
        }
        let partitions = ranges.len();

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(scan_threads(partitions))
            .thread_name(|i| format!("slab-scan-{}", i))
            .build()
            .map_err(|e| Error::Storage(format!("Failed to start scan workers: {}", e)))?;

        let results: Vec<Result<()>> = workers.install(|| {
            ranges
                .into_par_iter()
                .map(|range| self.scan_range(range, &callback))
                .collect()
        });

        let mut failures = results.into_iter().filter_map(|r| r.err());
        match failures.next() {
            None => Ok(()),
            Some(first) => Err(Error::ScanFailed {
                failed: 1 + failures.count(),
                partitions,
                first: Box::new(first),
            }),
        }
    }

    fn scan_range<F>(&self, range: Range<u64>, callback: &F) -> Result<()>
    where
        F: Fn(SlotIndex, &T) -> Result<()>,
    {
        for i in range {
            let idx = SlotIndex(i);
            if let Some(payload) = self.arena.slot_at(idx)?.payload() {
                callback(idx, payload)?;
            }
        }
        Ok(())
    }

    /// Check that the free chain and the occupied slots partition the arena
    pub fn verify(&self) -> Result<SlabReport> {
        let len = self.len();
        let chain = free_list::chain(&self.arena)?;

        let mut on_chain = vec![false; len as usize];
        for idx in &chain {
            on_chain[idx.0 as usize] = true;
        }

        let mut occupied = 0;
        for i in 0..len {
            match (self.arena.slot_state(SlotIndex(i))?, on_chain[i as usize]) {
                (SlotState::Occupied, false) => occupied += 1,
                (SlotState::Vacant, true) => {}
                (SlotState::Vacant, false) => {
                    return Err(Error::Corrupt(format!(
                        "vacant Slot({}) is not reachable from the free list",
                        i
                    )))
                }
                (SlotState::Occupied, true) => {
                    return Err(Error::Corrupt(format!(
                        "occupied Slot({}) is on the free list",
                        i
                    )))
                }
            }
        }

        Ok(SlabReport {
            len,
            occupied,
            free: chain.len() as u64,
        })
    }

    /// Get statistics about the allocator
    pub fn stats(&self) -> Result<SlabStats> {
        let free_slots = free_list::chain(&self.arena)?.len() as u64;
        let total_slots = self.len();
        Ok(SlabStats {
            slot_size: self.arena.slot_size(),
            segment_slots: self.arena.segment_slots(),
            segments: self.arena.segments(),
            capacity_slots: self.arena.capacity_slots(),
            total_slots,
            free_slots,
            allocated_slots: total_slots - free_slots,
            mapped_bytes: self.arena.pool().mapped_len(),
        })
    }

    /// Arm a crash simulation for the next commit
    pub fn set_fail_point(&mut self, fail_point: Option<FailPoint>) {
        self.arena.pool_mut().set_fail_point(fail_point);
    }

    /// Sync every slot to disk
    pub fn flush(&self) -> Result<()> {
        self.arena.pool().flush()
    }

    /// Flush all mapped data to disk and release the pool
    pub fn close(self) -> Result<()> {
        self.arena.into_pool().close()
    }
}

/// Split `[0, len)` into at most `concurrency` contiguous ranges whose sizes
/// differ by at most one. Empty ranges are dropped.
pub fn partition(len: u64, concurrency: usize) -> Vec<Range<u64>> {
    let parts = (concurrency.max(1) as u64).min(len);
    if parts == 0 {
        return Vec::new();
    }

    let base = len / parts;
    let extra = len % parts;
    let mut ranges = Vec::with_capacity(parts as usize);
    let mut start = 0;
    for i in 0..parts {
        let size = base + u64::from(i < extra);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// Worker threads per available CPU that a scan may start
pub const SCAN_THREADS_PER_CPU: usize = 4;

/// Threads used to scan `partitions` partitions
///
/// Partitions beyond the thread count queue on the same workers.
pub fn scan_threads(partitions: usize) -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    partitions.min(cpus * SCAN_THREADS_PER_CPU).max(1)
}

/// Outcome of a successful [`SlabAllocator::verify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabReport {
    pub len: u64,
    pub occupied: u64,
    pub free: u64,
}

/// Statistics for the slab allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabStats {
    pub slot_size: usize,
    pub segment_slots: u32,
    pub segments: u64,
    pub capacity_slots: u64,
    pub total_slots: u64,
    pub free_slots: u64,
    pub allocated_slots: u64,
    pub mapped_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pool::MIN_POOL_SIZE;
    use parking_lot::Mutex;

    fn allocator(dir: &tempfile::TempDir) -> Result<SlabAllocator<(u64, u64)>> {
        let pool = Pool::create(dir.path(), "allocator-test", 256 * 1024)?;
        SlabAllocator::create(pool, 64, 8)
    }

    fn scratch() -> Result<tempfile::TempDir> {
        tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))
    }

    #[test]
    fn test_partition_balanced() {
        assert!(partition(0, 4).is_empty());
        assert_eq!(partition(3, 8), vec![0..1, 1..2, 2..3]);
        assert_eq!(partition(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(partition(5, 0), vec![0..5]);
    }

    #[test]
    fn test_scan_threads_capped() {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        assert_eq!(scan_threads(0), 1);
        assert_eq!(scan_threads(1), 1);
        assert_eq!(scan_threads(100_000), cpus * SCAN_THREADS_PER_CPU);
    }

    #[test]
    fn test_allocator_reuse() -> Result<()> {
        let dir = scratch()?;
        let mut slab = allocator(&dir)?;

        let slot1 = slab.insert(&(1, 10))?;
        let slot2 = slab.insert(&(2, 20))?;
        assert_ne!(slot1, slot2);

        // Free first slot; next insertion reuses it
        slab.remove(slot1)?;
        let slot3 = slab.insert(&(3, 30))?;
        assert_eq!(slot3, slot1);
        assert_eq!(slab.get(slot3)?, (3, 30));

        // Nothing free: append
        assert_eq!(slab.insert(&(4, 40))?, SlotIndex(2));
        Ok(())
    }

    #[test]
    fn test_remove_errors() -> Result<()> {
        let dir = scratch()?;
        let mut slab = allocator(&dir)?;
        let idx = slab.insert(&(1, 1))?;

        slab.remove(idx)?;
        assert!(matches!(slab.remove(idx), Err(Error::NotFound(_))));
        assert!(matches!(slab.get(idx), Err(Error::NotFound(_))));
        assert!(matches!(
            slab.remove(SlotIndex(5)),
            Err(Error::OutOfRange { index: 5, len: 1 })
        ));
        Ok(())
    }

    #[test]
    fn test_update_in_place() -> Result<()> {
        let dir = scratch()?;
        let mut slab = allocator(&dir)?;
        let idx = slab.insert(&(1, 1))?;

        slab.update(idx, &(1, 2))?;
        assert_eq!(slab.get(idx)?, (1, 2));

        slab.remove(idx)?;
        assert!(matches!(slab.update(idx, &(1, 3)), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_oversized_insert_changes_nothing() -> Result<()> {
        let dir = scratch()?;
        let pool = Pool::create(dir.path(), "allocator-test", MIN_POOL_SIZE)?;
        let mut slab: SlabAllocator<String> = SlabAllocator::create(pool, 32, 4)?;

        let idx = slab.insert(&"ok".to_string())?;
        slab.remove(idx)?;

        let big = "x".repeat(64);
        assert!(matches!(
            slab.insert(&big),
            Err(Error::PayloadTooLarge { .. })
        ));
        assert_eq!(slab.arena().free_head(), Some(idx));
        assert_eq!(slab.verify()?, SlabReport { len: 1, occupied: 0, free: 1 });
        Ok(())
    }

    #[test]
    fn test_scan_matches_sequential() -> Result<()> {
        let dir = scratch()?;
        let mut slab = allocator(&dir)?;
        for i in 0..40 {
            slab.insert(&(i, i * 2))?;
        }
        for i in (0..40).step_by(3) {
            slab.remove(SlotIndex(i))?;
        }

        let collect = |concurrency| -> Result<Vec<(SlotIndex, (u64, u64))>> {
            let seen = Mutex::new(Vec::new());
            slab.scan(concurrency, |idx, value| {
                seen.lock().push((idx, *value));
                Ok(())
            })?;
            let mut seen = seen.into_inner();
            seen.sort();
            Ok(seen)
        };

        let sequential = collect(1)?;
        assert_eq!(sequential.len(), 26);
        assert_eq!(collect(4)?, sequential);
        assert_eq!(collect(64)?, sequential);
        // Concurrency far beyond the slot count
        assert_eq!(collect(100_000)?, sequential);
        assert!(matches!(
            slab.scan(0, |_, _| Ok(())),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_scan_aggregates_failures() -> Result<()> {
        let dir = scratch()?;
        let mut slab = allocator(&dir)?;
        for i in 0..8 {
            slab.insert(&(i, i))?;
        }

        let result = slab.scan(4, |idx, _| {
            if idx.0 % 2 == 0 {
                Err(Error::InvalidArgument(format!("rejected {}", idx)))
            } else {
                Ok(())
            }
        });

        match result {
            Err(Error::ScanFailed {
                failed,
                partitions,
                first,
            }) => {
                assert_eq!(failed, 4);
                assert_eq!(partitions, 4);
                assert!(first.to_string().contains("Slot(0)"));
            }
            other => panic!("expected ScanFailed, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_allocator_stats() -> Result<()> {
        let dir = scratch()?;
        let mut slab = allocator(&dir)?;

        for i in 0..10 {
            slab.insert(&(i, i))?;
        }
        slab.remove(SlotIndex(4))?;

        let stats = slab.stats()?;
        assert_eq!(stats.total_slots, 10);
        assert_eq!(stats.free_slots, 1);
        assert_eq!(stats.allocated_slots, 9);
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.slot_size, 64);
        Ok(())
    }
}
