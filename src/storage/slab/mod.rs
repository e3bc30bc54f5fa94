//! Slab Allocator
//!
//! Manages durable storage as one arena of fixed-size slots. Freed slots
//! form an intrusive LIFO list and are reused before the arena grows.
//!
//! # Architecture
//!
//! ```text
//! SlabAllocator<T>
//!   └─→ Arena<T>   → [Occupied | Vacant | Occupied | Vacant | ...]
//!         │                        │                    │
//!         └─→ free head ───────────┴──→ next ───────────┘
//! ```
//!
//! Every slot state change runs inside a pool transaction together with the
//! free-list links it touches.

pub mod allocator;
pub mod arena;
pub mod free_list;
pub mod slot;

pub use allocator::{partition, scan_threads, SlabAllocator, SlabReport, SlabStats};
pub use arena::{Arena, ArenaTx, SlotLayout, DEFAULT_SEGMENT_SLOTS};
pub use slot::{Slot, SlotIndex, SlotState, MIN_SLOT_SIZE, SLOT_HEADER_SIZE};
