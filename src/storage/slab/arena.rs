//! Durable arena of fixed-size slots
//!
//! The arena is an append-only sequence of slots in the pool's data region,
//! grown one segment (`segment_slots` slots) at a time. Its root record in
//! the pool root area holds the slot geometry, the length and the free head.
//!
//! ```text
//! root @ ROOT_OFFSET
//!   +0  magic "SLABROOT"
//!   +8  slot_size      (u32)
//!   +12 segment_slots  (u32)
//!   +16 len            (u64)
//!   +24 free_head      (u64, index + 1, 0 = empty)
//!
//! data @ HEADER_SIZE
//!   | seg 0: slot 0 .. slot N-1 | seg 1: slot N .. | ...
//! ```

use super::slot::{
    decode_link, encode_link, encode_occupied, encode_payload, Slot, SlotIndex, SlotState,
    MIN_SLOT_SIZE, NEXT_FREE_OFFSET, PAYLOAD_OFFSET,
};
use crate::error::{Error, Result};
use crate::storage::pool::{Pool, HEADER_SIZE, ROOT_OFFSET};
use crate::storage::transaction::Transaction;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tracing::{debug, info};

/// Root record magic ("SLABROOT")
pub const ROOT_MAGIC: u64 = u64::from_le_bytes(*b"SLABROOT");

const ROOT_MAGIC_AT: u64 = ROOT_OFFSET;
const SLOT_SIZE_AT: u64 = ROOT_OFFSET + 8;
const SEGMENT_SLOTS_AT: u64 = ROOT_OFFSET + 12;
const LEN_AT: u64 = ROOT_OFFSET + 16;
const FREE_HEAD_AT: u64 = ROOT_OFFSET + 24;

// Every pool maps at least its header page, so root reads never fall outside
// the mapping.
const _: () = assert!(FREE_HEAD_AT + 8 <= HEADER_SIZE);

/// First byte of slot 0
pub const DATA_OFFSET: u64 = HEADER_SIZE;

/// Default number of slots per segment
pub const DEFAULT_SEGMENT_SLOTS: u32 = 1024;

/// Slot geometry shared by the arena and its transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub slot_size: usize,
    pub segment_slots: u32,
}

impl SlotLayout {
    pub fn new(slot_size: usize, segment_slots: u32) -> Result<Self> {
        if slot_size < MIN_SLOT_SIZE || slot_size % 8 != 0 || slot_size > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "slot size {} must be a multiple of 8 and at least {}",
                slot_size, MIN_SLOT_SIZE
            )));
        }
        if segment_slots == 0 {
            return Err(Error::InvalidArgument(
                "segment must hold at least one slot".to_string(),
            ));
        }
        Ok(Self {
            slot_size,
            segment_slots,
        })
    }

    /// Byte offset of a slot in the pool
    pub fn slot_offset(&self, idx: SlotIndex) -> u64 {
        DATA_OFFSET + idx.0 * self.slot_size as u64
    }

    pub fn segment_bytes(&self) -> u64 {
        self.segment_slots as u64 * self.slot_size as u64
    }

    /// Fail with `OutOfSpace` unless `capacity` holds at least one segment
    pub fn check_fits(&self, capacity: u64) -> Result<()> {
        if self.bytes_for(1) > capacity {
            return Err(Error::OutOfSpace(format!(
                "capacity {} cannot hold one segment of {} bytes",
                capacity,
                self.segment_bytes()
            )));
        }
        Ok(())
    }

    /// Pool bytes needed to hold `slots` slots in whole segments
    pub fn bytes_for(&self, slots: u64) -> u64 {
        let segments = slots.div_ceil(self.segment_slots as u64);
        DATA_OFFSET + segments * self.segment_bytes()
    }
}

/// Write an empty arena root into a pool that holds none yet
pub fn init_root(pool: &mut Pool, layout: SlotLayout) -> Result<()> {
    if pool.read_u64(ROOT_MAGIC_AT)? != 0 {
        return Err(Error::AlreadyExists(format!(
            "pool {:?} already holds an arena",
            pool.path()
        )));
    }
    layout.check_fits(pool.capacity())?;

    pool.run_transaction(|tx| {
        tx.write_u32(SLOT_SIZE_AT, layout.slot_size as u32)?;
        tx.write_u32(SEGMENT_SLOTS_AT, layout.segment_slots)?;
        tx.write_u64(LEN_AT, 0)?;
        tx.write_u64(FREE_HEAD_AT, 0)?;
        tx.write_u64(ROOT_MAGIC_AT, ROOT_MAGIC)
    })?;

    info!(
        slot_size = layout.slot_size,
        segment_slots = layout.segment_slots,
        "Initialized slab arena"
    );
    Ok(())
}

/// Durable, append-only sequence of slots holding `T`
pub struct Arena<T> {
    pool: Pool,
    layout: SlotLayout,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Arena<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Initialize an empty arena in a freshly created pool
    pub fn create(mut pool: Pool, layout: SlotLayout) -> Result<Self> {
        init_root(&mut pool, layout)?;
        Ok(Self {
            pool,
            layout,
            _payload: PhantomData,
        })
    }

    /// Attach to the arena stored in `pool`, validating its root record
    pub fn open(pool: Pool) -> Result<Self> {
        let magic = pool.read_u64(ROOT_MAGIC_AT)?;
        if magic != ROOT_MAGIC {
            return Err(Error::Corrupt(format!(
                "pool {:?} holds no slab root",
                pool.path()
            )));
        }

        let layout = SlotLayout::new(
            pool.read_u32(SLOT_SIZE_AT)? as usize,
            pool.read_u32(SEGMENT_SLOTS_AT)?,
        )
        .map_err(|e| Error::Corrupt(format!("bad slab geometry: {}", e)))?;

        let len = pool.read_u64(LEN_AT)?;
        if layout.bytes_for(len) > pool.mapped_len() {
            return Err(Error::Corrupt(format!(
                "arena length {} exceeds mapped pool of {} bytes",
                len,
                pool.mapped_len()
            )));
        }

        let head = decode_link(pool.read_u64(FREE_HEAD_AT)?);
        if let Some(head) = head {
            if head.0 >= len {
                return Err(Error::Corrupt(format!(
                    "free head {} beyond arena length {}",
                    head, len
                )));
            }
        }

        debug!(len, slot_size = layout.slot_size, "Opened slab arena");

        Ok(Self {
            pool,
            layout,
            _payload: PhantomData,
        })
    }

    /// Number of slots ever appended (occupied + vacant)
    pub fn len(&self) -> u64 {
        self.root_u64(LEN_AT)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    pub fn slot_size(&self) -> usize {
        self.layout.slot_size
    }

    pub fn segment_slots(&self) -> u32 {
        self.layout.segment_slots
    }

    /// Segments currently backed by the pool file
    pub fn segments(&self) -> u64 {
        self.pool.mapped_len().saturating_sub(DATA_OFFSET) / self.layout.segment_bytes()
    }

    /// Most slots the pool capacity can ever hold
    pub fn capacity_slots(&self) -> u64 {
        let segments = self.pool.capacity().saturating_sub(DATA_OFFSET) / self.layout.segment_bytes();
        segments * self.layout.segment_slots as u64
    }

    /// Head of the committed free chain
    pub fn free_head(&self) -> Option<SlotIndex> {
        decode_link(self.root_u64(FREE_HEAD_AT))
    }

    fn root_u64(&self, offset: u64) -> u64 {
        let bytes = &self.pool.mapped()[offset as usize..offset as usize + 8];
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        u64::from_le_bytes(buf)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut Pool {
        &mut self.pool
    }

    pub fn into_pool(self) -> Pool {
        self.pool
    }

    fn check_index(&self, idx: SlotIndex) -> Result<()> {
        let len = self.len();
        if idx.0 >= len {
            return Err(Error::OutOfRange { index: idx.0, len });
        }
        Ok(())
    }

    /// Decode the slot at `idx`
    pub fn slot_at(&self, idx: SlotIndex) -> Result<Slot<T>> {
        self.check_index(idx)?;
        let bytes = self
            .pool
            .read(self.layout.slot_offset(idx), self.layout.slot_size)?;
        Slot::decode(bytes)
    }

    /// Committed state of the slot at `idx`, without decoding its payload
    pub fn slot_state(&self, idx: SlotIndex) -> Result<SlotState> {
        self.check_index(idx)?;
        let tag = self.pool.read(self.layout.slot_offset(idx), 1)?[0];
        SlotState::from_tag(tag)
    }

    /// Append one occupied slot holding `payload`
    pub fn append(&mut self, payload: &T) -> Result<SlotIndex> {
        let image = encode_occupied(payload, self.layout.slot_size)?;
        let len = self.len();

        if len >= self.capacity_slots() {
            return Err(Error::CapacityExceeded(format!(
                "arena full at {} slots",
                len
            )));
        }
        self.pool.grow(self.layout.bytes_for(len + 1))?;

        // Beyond `len`, so invisible to recovery until the length commits
        let idx = SlotIndex(len);
        self.pool.persist(self.layout.slot_offset(idx), &image)?;
        self.pool.run_transaction(|tx| tx.write_u64(LEN_AT, len + 1))?;

        debug!(slot = %idx, "Appended slot");
        Ok(idx)
    }

    /// Durably write `payload` into the vacant slot `idx` without occupying it
    ///
    /// The payload range is disjoint from the free link, so the slot stays a
    /// valid member of the free chain until [`ArenaTx::mark_occupied`] commits.
    pub fn persist_payload(&mut self, idx: SlotIndex, payload: &T) -> Result<()> {
        if self.slot_state(idx)? != SlotState::Vacant {
            return Err(Error::InvalidArgument(format!(
                "{} is occupied; payload must be written transactionally",
                idx
            )));
        }
        let region = encode_payload(payload, self.layout.slot_size)?;
        self.pool
            .persist(self.layout.slot_offset(idx) + PAYLOAD_OFFSET, &region)
    }

    /// Run `body` as one transaction over the arena
    pub fn run<R, F>(&mut self, body: F) -> Result<R>
    where
        F: FnOnce(&mut ArenaTx<'_, '_>) -> Result<R>,
    {
        let layout = self.layout;
        self.pool
            .run_transaction(|tx| body(&mut ArenaTx { tx, layout }))
    }
}

/// Arena view of an open transaction: every slot state change goes here
pub struct ArenaTx<'t, 'p> {
    tx: &'t mut Transaction<'p>,
    layout: SlotLayout,
}

impl<'t, 'p> ArenaTx<'t, 'p> {
    /// Run a nested body that joins this transaction
    pub fn run<R, F>(&mut self, body: F) -> Result<R>
    where
        F: FnOnce(&mut ArenaTx<'_, 'p>) -> Result<R>,
    {
        let layout = self.layout;
        self.tx.run(|tx| body(&mut ArenaTx { tx, layout }))
    }

    /// Arena length as seen by this transaction
    pub fn len(&self) -> Result<u64> {
        self.tx.read_u64(LEN_AT)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn free_head(&self) -> Result<Option<SlotIndex>> {
        Ok(decode_link(self.tx.read_u64(FREE_HEAD_AT)?))
    }

    pub fn set_free_head(&mut self, head: Option<SlotIndex>) -> Result<()> {
        self.tx.write_u64(FREE_HEAD_AT, encode_link(head))
    }

    fn check_index(&self, idx: SlotIndex) -> Result<()> {
        let len = self.len()?;
        if idx.0 >= len {
            return Err(Error::OutOfRange { index: idx.0, len });
        }
        Ok(())
    }

    pub fn slot_state(&self, idx: SlotIndex) -> Result<SlotState> {
        self.check_index(idx)?;
        SlotState::from_tag(self.tx.read_u8(self.layout.slot_offset(idx))?)
    }

    /// Free-list successor of the vacant slot `idx`
    pub fn next_free(&self, idx: SlotIndex) -> Result<Option<SlotIndex>> {
        if self.slot_state(idx)? != SlotState::Vacant {
            return Err(Error::Corrupt(format!("{} is on the free list but occupied", idx)));
        }
        let raw = self
            .tx
            .read_u64(self.layout.slot_offset(idx) + NEXT_FREE_OFFSET)?;
        Ok(decode_link(raw))
    }

    /// Flip the slot to occupied; its payload must already be persisted
    pub fn mark_occupied(&mut self, idx: SlotIndex) -> Result<()> {
        self.check_index(idx)?;
        self.tx
            .write_u8(self.layout.slot_offset(idx), SlotState::Occupied.tag())
    }

    /// Flip the slot to vacant and point its link at `next`
    pub fn mark_vacant(&mut self, idx: SlotIndex, next: Option<SlotIndex>) -> Result<()> {
        self.check_index(idx)?;
        let offset = self.layout.slot_offset(idx);
        self.tx.write_u8(offset, SlotState::Vacant.tag())?;
        self.tx.write_u64(offset + NEXT_FREE_OFFSET, encode_link(next))
    }

    /// Replace the payload of an occupied slot
    pub fn update_payload<T: Serialize>(&mut self, idx: SlotIndex, payload: &T) -> Result<()> {
        if self.slot_state(idx)? != SlotState::Occupied {
            return Err(Error::NotFound(format!("{} is vacant", idx)));
        }
        let region = encode_payload(payload, self.layout.slot_size)?;
        self.tx
            .write(self.layout.slot_offset(idx) + PAYLOAD_OFFSET, &region)
    }
}
