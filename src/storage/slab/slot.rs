//! Slot management for slab allocator

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag byte of a vacant slot. An all-zero slot is vacant with no successor.
pub const TAG_VACANT: u8 = 0;
/// Tag byte of an occupied slot
pub const TAG_OCCUPIED: u8 = 1;

/// Offset of the free-list link inside a slot
pub const NEXT_FREE_OFFSET: u64 = 8;
/// Offset of the payload length inside a slot; the payload follows it
pub const PAYLOAD_OFFSET: u64 = 16;
/// Bytes of every slot used by the tag, link and length fields
pub const SLOT_HEADER_SIZE: usize = 20;

/// Smallest supported slot size
pub const MIN_SLOT_SIZE: usize = 32;

/// Dense, zero-based position of a slot in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub u64);

impl SlotIndex {
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for SlotIndex {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

/// Occupancy of a slot, as recorded by its tag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Vacant,
    Occupied,
}

impl SlotState {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            TAG_VACANT => Ok(Self::Vacant),
            TAG_OCCUPIED => Ok(Self::Occupied),
            other => Err(Error::Corrupt(format!("unknown slot tag {}", other))),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Vacant => TAG_VACANT,
            Self::Occupied => TAG_OCCUPIED,
        }
    }
}

/// A decoded slot of the arena
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<T> {
    /// Free, linked to the next free slot (if any)
    Vacant { next: Option<SlotIndex> },
    /// Allocated, holding a payload
    Occupied { payload: T },
}

impl<T> Slot<T> {
    pub fn state(&self) -> SlotState {
        match self {
            Self::Vacant { .. } => SlotState::Vacant,
            Self::Occupied { .. } => SlotState::Occupied,
        }
    }

    pub fn is_occupied(&self) -> bool {
        matches!(self, Self::Occupied { .. })
    }

    pub fn payload(&self) -> Option<&T> {
        match self {
            Self::Occupied { payload } => Some(payload),
            Self::Vacant { .. } => None,
        }
    }

    pub fn into_payload(self) -> Option<T> {
        match self {
            Self::Occupied { payload } => Some(payload),
            Self::Vacant { .. } => None,
        }
    }

    pub fn next_free(&self) -> Option<SlotIndex> {
        match self {
            Self::Vacant { next } => *next,
            Self::Occupied { .. } => None,
        }
    }
}

impl<T: DeserializeOwned> Slot<T> {
    /// Decode a slot from its on-disk bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SLOT_HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "slot of {} bytes is smaller than its header",
                bytes.len()
            )));
        }

        match SlotState::from_tag(bytes[0])? {
            SlotState::Vacant => Ok(Self::Vacant {
                next: decode_link(read_u64(bytes, NEXT_FREE_OFFSET as usize)),
            }),
            SlotState::Occupied => {
                let len = read_u32(bytes, PAYLOAD_OFFSET as usize) as usize;
                let body = bytes
                    .get(SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + len)
                    .ok_or_else(|| {
                        Error::Corrupt(format!(
                            "payload length {} exceeds slot of {} bytes",
                            len,
                            bytes.len()
                        ))
                    })?;
                let payload = serde_json::from_slice(body).map_err(|e| {
                    Error::SerializationError(format!("Failed to decode payload: {}", e))
                })?;
                Ok(Self::Occupied { payload })
            }
        }
    }
}

/// Encode the payload region (length prefix + serialized payload)
pub fn encode_payload<T: Serialize>(payload: &T, slot_size: usize) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)
        .map_err(|e| Error::SerializationError(format!("Failed to encode payload: {}", e)))?;

    let capacity = slot_size.saturating_sub(SLOT_HEADER_SIZE);
    if body.len() > capacity {
        return Err(Error::PayloadTooLarge {
            size: body.len(),
            capacity,
        });
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Encode a complete occupied slot image
pub fn encode_occupied<T: Serialize>(payload: &T, slot_size: usize) -> Result<Vec<u8>> {
    let region = encode_payload(payload, slot_size)?;
    let mut buf = vec![0u8; PAYLOAD_OFFSET as usize];
    buf[0] = TAG_OCCUPIED;
    buf.extend_from_slice(&region);
    Ok(buf)
}

/// On-disk form of a free-list link: index + 1, with 0 meaning none
pub fn encode_link(next: Option<SlotIndex>) -> u64 {
    next.map_or(0, |idx| idx.0 + 1)
}

pub fn decode_link(raw: u64) -> Option<SlotIndex> {
    raw.checked_sub(1).map(SlotIndex)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
