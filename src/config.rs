//! Store configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `SLABKV_*` environment variables (e.g. `SLABKV_SLOT_SIZE=512`).

use crate::error::{Error, Result};
use crate::storage::slab::{DEFAULT_SEGMENT_SLOTS, MIN_SLOT_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of the environment variables read by [`StoreConfig::load`]
pub const ENV_PREFIX: &str = "SLABKV";

/// Default pool capacity (80 MiB)
pub const DEFAULT_CAPACITY: u64 = 80 * 1024 * 1024;

/// Default slot size in bytes
pub const DEFAULT_SLOT_SIZE: usize = 256;

/// Configuration for a [`HybridStore`](crate::kv::HybridStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum size of the pool file in bytes
    pub capacity: u64,
    /// Bytes per slot, header included; only used when creating a pool
    pub slot_size: usize,
    /// Slots added each time the arena grows; only used when creating a pool
    pub segment_slots: u32,
    /// Worker threads for scans and index rebuilds
    pub scan_concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
            segment_slots: DEFAULT_SEGMENT_SLOTS,
            scan_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl StoreConfig {
    /// Load the configuration, optionally layering a TOML file over the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Self::default())
            .map_err(|e| Error::InvalidArgument(format!("Invalid default config: {}", e)))?;

        let mut builder = ::config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        let loaded: Self = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| Error::InvalidArgument(format!("Failed to load config: {}", e)))?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_size < MIN_SLOT_SIZE || self.slot_size % 8 != 0 {
            return Err(Error::InvalidArgument(format!(
                "slot_size {} must be a multiple of 8 and at least {}",
                self.slot_size, MIN_SLOT_SIZE
            )));
        }
        if self.segment_slots == 0 {
            return Err(Error::InvalidArgument(
                "segment_slots must be at least 1".to_string(),
            ));
        }
        if self.scan_concurrency == 0 {
            return Err(Error::InvalidArgument(
                "scan_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    pub fn with_segment_slots(mut self, segment_slots: u32) -> Self {
        self.segment_slots = segment_slots;
        self
    }

    pub fn with_scan_concurrency(mut self, scan_concurrency: usize) -> Self {
        self.scan_concurrency = scan_concurrency;
        self
    }
}
