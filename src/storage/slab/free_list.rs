//! Intrusive free list threaded through vacant slots
//!
//! The list has no storage of its own: the head lives in the arena root and
//! each vacant slot carries the index of the next one. Push and pop are O(1)
//! and only ever run inside an arena transaction, together with the state
//! change of the slot they link or unlink.

use super::arena::{Arena, ArenaTx};
use super::slot::{SlotIndex, SlotState};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Whether the committed free list holds any slot
pub fn has_free<T>(arena: &Arena<T>) -> bool
where
    T: Serialize + DeserializeOwned,
{
    arena.free_head().is_some()
}

/// Unlink the head of the free list and return it.
///
/// The caller must re-occupy the slot in the same transaction; otherwise the
/// slot is lost to both the free list and the occupied set.
pub fn pop_free(atx: &mut ArenaTx<'_, '_>) -> Result<SlotIndex> {
    let head = atx.free_head()?.ok_or(Error::ListEmpty)?;
    let next = atx.next_free(head)?;
    atx.set_free_head(next)?;
    Ok(head)
}

/// Mark `idx` vacant and prepend it to the free list
pub fn push_free(atx: &mut ArenaTx<'_, '_>, idx: SlotIndex) -> Result<()> {
    // Read the old head before the new one is staged
    let old_head = atx.free_head()?;
    atx.mark_vacant(idx, old_head)?;
    atx.set_free_head(Some(idx))
}

/// Walk the committed free chain from its head.
///
/// Fails with `Corrupt` on a link past the arena end, a link to an occupied
/// slot, or a cycle.
pub fn chain<T>(arena: &Arena<T>) -> Result<Vec<SlotIndex>>
where
    T: Serialize + DeserializeOwned,
{
    let len = arena.len();
    let mut visited = vec![false; len as usize];
    let mut chain = Vec::new();
    let mut cursor = arena.free_head();

    while let Some(idx) = cursor {
        if idx.0 >= len {
            return Err(Error::Corrupt(format!(
                "free list links to {} beyond arena length {}",
                idx, len
            )));
        }
        if visited[idx.0 as usize] {
            return Err(Error::Corrupt(format!("free list cycles back to {}", idx)));
        }
        visited[idx.0 as usize] = true;

        let slot = arena.slot_at(idx)?;
        if slot.state() != SlotState::Vacant {
            return Err(Error::Corrupt(format!("occupied {} is on the free list", idx)));
        }
        chain.push(idx);
        cursor = slot.next_free();
    }

    Ok(chain)
}
