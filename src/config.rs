//! Device configuration (ambient stack: spec.md is silent on configuration
//! shape, grounded in the teacher's `Config`/`DatabaseConfig` pattern).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static configuration for one vdo-core instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdoConfig {
    /// Total physical blocks backing this device.
    pub physical_blocks: u64,
    /// Blocks per slab. Must be a power of two (spec §4.4's `slabNumber =
    /// (pbn - origin) / slabBlocks` relies on this for fast division).
    pub slab_blocks: u64,
    /// Number of logical zone threads (`N_L`).
    pub logical_zones: u32,
    /// Number of physical zone threads (`N_P`).
    pub physical_zones: u32,
    /// Number of on-disk recovery journal blocks in the ring.
    pub recovery_journal_blocks: u32,
    /// Max block-map deltas per recovery journal block.
    pub recovery_journal_entries_per_block: u32,
    /// Max distinct LBNs held in a packer bin before it is forced to flush.
    pub packer_bins_full_threshold: u8,
    /// How long the packer waits before force-flushing a partial bin.
    pub packer_flush_interval: Duration,
    /// Bound on concurrently in-flight data VIOs (the request limiter).
    pub max_in_flight_vios: usize,
    /// Separate bound for in-flight discard VIOs.
    pub max_in_flight_discards: usize,
    /// CPU worker threads used for hashing and compression.
    pub cpu_workers: usize,
}

impl Default for VdoConfig {
    fn default() -> Self {
        Self {
            physical_blocks: 1 << 20,
            slab_blocks: 1 << 15,
            logical_zones: 4,
            physical_zones: 4,
            recovery_journal_blocks: 32,
            recovery_journal_entries_per_block: 256,
            packer_bins_full_threshold: crate::types::MAX_COMPRESSION_SLOTS,
            packer_flush_interval: Duration::from_millis(100),
            max_in_flight_vios: 2048,
            max_in_flight_discards: 256,
            cpu_workers: num_cpus::get().max(1),
        }
    }
}

impl VdoConfig {
    pub fn slab_count(&self) -> u64 {
        self.physical_blocks.div_ceil(self.slab_blocks)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.slab_blocks == 0 || !self.slab_blocks.is_power_of_two() {
            return Err("slab_blocks must be a nonzero power of two".into());
        }
        if self.logical_zones == 0 || self.physical_zones == 0 {
            return Err("zone counts must be nonzero".into());
        }
        if self.packer_bins_full_threshold == 0
            || self.packer_bins_full_threshold > crate::types::MAX_COMPRESSION_SLOTS
        {
            return Err("packer_bins_full_threshold out of range".into());
        }
        Ok(())
    }

    /// Serialize to the JSON shape persisted alongside the super-block by
    /// the admin surface (spec §6's on-disk layout covers the data
    /// structures; the config blob riding next to it is ambient).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
