//! Hybrid key-value layer
//!
//! ```text
//! HybridStore<K, V>
//!   ├─→ VolatileIndex<K>   (DRAM)  key → SlotIndex
//!   └─→ SlabAllocator      (pool)  SlotIndex → Entry { key, value }
//! ```

pub mod index;
pub mod store;

pub use index::VolatileIndex;
pub use store::{Entry, HybridStore, StoreStats, LAYOUT};
