//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! Pool (pool.bin, memory-mapped)
//!   ├─→ header page: PoolHeader + root area
//!   └─→ data region: slab arena segments
//!
//! Journal (pool.journal)
//!   └─→ at most one redo record, replayed or discarded on open
//! ```
//!
//! ## Transactions
//!
//! A [`Transaction`] stages writes against the mapped pool and reads its own
//! writes back. On commit the writes become one checksummed journal record,
//! which is synced before any byte of the pool changes. A crash at any point
//! therefore leaves either the old or the new state after recovery.
//!
//! ## Slab
//!
//! The [`slab`] module builds a fixed-slot arena with an intrusive free list on
//! top of the pool.

pub mod journal;
pub mod pool;
pub mod slab;
pub mod transaction;

pub use pool::{FailPoint, Pool, PoolHeader};
pub use slab::{Arena, SlabAllocator, SlabReport, SlabStats, Slot, SlotIndex, SlotState};
pub use transaction::Transaction;
