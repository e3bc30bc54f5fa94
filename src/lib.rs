// slabkv - crash-consistent slab allocator with a hybrid key-value store
// Durable slots live in a memory-mapped pool, the key index lives in DRAM.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod kv;
pub mod storage;

// Re-exports for convenience
pub use config::StoreConfig;
pub use kv::{Entry, HybridStore, VolatileIndex};
pub use storage::{FailPoint, Pool, SlabAllocator, Slot, SlotIndex, Transaction};

/// slabkv error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Slot index {index} out of range (length {len})")]
        OutOfRange { index: u64, len: u64 },

        #[error("Free list is empty")]
        ListEmpty,

        #[error("Capacity exceeded: {0}")]
        CapacityExceeded(String),

        #[error("Out of space: {0}")]
        OutOfSpace(String),

        #[error("Already exists: {0}")]
        AlreadyExists(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Duplicate key: {0}")]
        DuplicateKey(String),

        #[error("Transaction aborted: {0}")]
        TransactionAborted(String),

        #[error("Corrupt pool: {0}")]
        Corrupt(String),

        #[error("Payload of {size} bytes exceeds slot capacity of {capacity} bytes")]
        PayloadTooLarge { size: usize, capacity: usize },

        #[error("Scan failed in {failed} of {partitions} partitions: {first}")]
        ScanFailed {
            failed: usize,
            partitions: usize,
            first: Box<Error>,
        },

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Serialization error: {0}")]
        SerializationError(String),

        #[error("Storage error: {0}")]
        Storage(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = error::Error::OutOfRange { index: 7, len: 3 };
        assert_eq!(err.to_string(), "Slot index 7 out of range (length 3)");

        let err = error::Error::ScanFailed {
            failed: 1,
            partitions: 4,
            first: Box::new(error::Error::NotFound("key 5".to_string())),
        };
        assert!(err.to_string().contains("1 of 4 partitions"));
        assert!(err.to_string().contains("key 5"));
    }
}
