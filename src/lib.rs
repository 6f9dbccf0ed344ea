//! vdo-core: a block-level deduplicating, compressing storage virtualization
//! engine (spec overview). A [`device::VdoInstance`] sits between a logical
//! address space and a physical [`traits::BlockDevice`], deduplicating
//! identical blocks via content-addressed hash locks, packing compressible
//! blocks together, and recording every mapping change in a crash-recoverable
//! journal before it is applied.

pub mod admin;
pub mod block_map;
pub mod config;
pub mod data_vio;
pub mod device;
pub mod error;
pub mod gate;
pub mod hash_lock;
pub mod lock_counter;
pub mod logical_lock;
pub mod packed_block;
pub mod packer;
pub mod page_cache;
pub mod recovery_journal;
pub mod refcounts;
pub mod slab;
pub mod slab_depot;
pub mod statistics;
pub mod traits;
pub mod types;
pub mod zone;

pub use config::VdoConfig;
pub use device::VdoInstance;
pub use error::{Result, VdoError};
pub use statistics::StatisticsSnapshot;
pub use types::{BlockMapEntry, Fingerprint, Lbn, MappingState, Pbn, VDO_BLOCK_SIZE};

/// Initialize structured logging for a host process embedding this engine.
/// Mirrors the teacher's `main.rs` `tracing_subscriber::fmt()` setup; a
/// library has no business calling this itself, so callers (the admin
/// binary, or a test harness) opt in explicitly.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_target(false).with_thread_ids(true).with_level(true).try_init();
    });
}
