//! Per-recovery-journal-block lock counter (spec §4.5, §3).
//!
//! Field-for-field grounded in the original `lockCounter.c`
//! (`examples/original_source/vdo/base/lockCounter.c`): `journal_counters`,
//! `journal_decrement_counts`, `logical_zone_counts`, `physical_zone_counts`
//! and the per-zone-type atomic totals, reexpressed with `AtomicU32`/
//! `AtomicBool` the way the teacher's `transaction/wal.rs` uses atomics for
//! cross-thread counters.
//!
//! A recovery-journal block may be reclaimed only once all three zone-type
//! totals for it are zero (spec §3's lock-counter invariant). Decrements
//! that originate off the journal thread are batched into
//! `journal_decrement_counts` and only ever drained on the journal thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{Result, VdoError};

/// Per-block state. `journal_count` and the per-zone counts are touched only
/// from their owning thread (spec §5); the zone-type totals and the
/// cross-thread decrement counter are atomic.
struct BlockLocks {
    /// Count of VIOs that still owe a reference on the journal zone's
    /// behalf, initialized by the journal thread to the number of VIOs
    /// whose delta landed in this block.
    journal_count: u16,
    logical_zone_counts: Vec<u16>,
    physical_zone_counts: Vec<u16>,
    logical_total: AtomicU32,
    physical_total: AtomicU32,
    journal_total: AtomicU32,
    /// Decrements of the journal zone's counter observed from a non-journal
    /// thread, batched here and only ever subtracted on the journal thread.
    journal_decrement_counts: AtomicU32,
}

impl BlockLocks {
    fn new(logical_zones: usize, physical_zones: usize) -> Self {
        Self {
            journal_count: 0,
            logical_zone_counts: vec![0; logical_zones],
            physical_zone_counts: vec![0; physical_zones],
            logical_total: AtomicU32::new(0),
            physical_total: AtomicU32::new(0),
            journal_total: AtomicU32::new(0),
            journal_decrement_counts: AtomicU32::new(0),
        }
    }

    fn is_unlocked(&self) -> bool {
        self.logical_total.load(Ordering::Acquire) == 0
            && self.physical_total.load(Ordering::Acquire) == 0
            && self.journal_total.load(Ordering::Acquire) == 0
    }
}

/// Zone kinds that can hold a lock-counter reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    Journal,
    Logical(u32),
    Physical(u32),
}

/// Idle/notifying state machine for the reclaim notification (spec §4.5):
///
/// ```text
/// idle --(first zone-total reaches 0)--> notifying
/// notifying --(owner calls acknowledge_unlock)--> idle
/// ```
///
/// Implemented with a single `AtomicBool` compare-and-swap so concurrent
/// releases from different zone threads coalesce into one notification.
pub struct LockCounter {
    blocks: Vec<BlockLocks>,
    logical_zones: usize,
    physical_zones: usize,
    notifying: AtomicBool,
}

impl LockCounter {
    pub fn new(journal_block_count: usize, logical_zones: usize, physical_zones: usize) -> Self {
        Self {
            blocks: (0..journal_block_count)
                .map(|_| BlockLocks::new(logical_zones, physical_zones))
                .collect(),
            logical_zones,
            physical_zones,
            notifying: AtomicBool::new(false),
        }
    }

    fn block(&self, index: usize) -> Result<&BlockLocks> {
        self.blocks
            .get(index)
            .ok_or_else(|| VdoError::assertion(format!("invalid journal block index {index}")))
    }

    /// Called on the journal thread when a block is opened: initializes its
    /// lock count to the number of VIOs that will reference it. Asserts the
    /// block was fully drained before reuse (ring wraparound), matching the
    /// original's `initialize_lock_count` assertion.
    pub fn initialize_lock_count(&mut self, block_index: usize, vio_count: u16) -> Result<()> {
        let unlocked = self.block(block_index)?.is_unlocked();
        if !unlocked {
            return Err(VdoError::assertion(format!(
                "journal block {block_index} reused before fully unlocked"
            )));
        }
        let block = &mut self.blocks[block_index];
        block.journal_count = vio_count;
        block.journal_total.store(vio_count as u32, Ordering::Release);
        Ok(())
    }

    /// A VIO acquires a reference on behalf of `zone` after emitting its
    /// delta into `block_index` (spec §4.5 step 9 in the pipeline).
    pub fn acquire_reference(&mut self, block_index: usize, zone: ZoneType) -> Result<()> {
        let block = self
            .blocks
            .get_mut(block_index)
            .ok_or_else(|| VdoError::assertion(format!("invalid journal block index {block_index}")))?;
        match zone {
            ZoneType::Logical(z) => {
                let slot = block
                    .logical_zone_counts
                    .get_mut(z as usize)
                    .ok_or_else(|| VdoError::assertion(format!("invalid logical zone {z}")))?;
                *slot += 1;
                block.logical_total.fetch_add(1, Ordering::AcqRel);
            }
            ZoneType::Physical(z) => {
                let slot = block
                    .physical_zone_counts
                    .get_mut(z as usize)
                    .ok_or_else(|| VdoError::assertion(format!("invalid physical zone {z}")))?;
                *slot += 1;
                block.physical_total.fetch_add(1, Ordering::AcqRel);
            }
            ZoneType::Journal => {
                block.journal_count += 1;
                block.journal_total.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Release a reference, called on the owning zone's thread for
    /// logical/physical zones, or on the journal thread for `Journal`.
    /// Returns whether this release drove the corresponding zone-type total
    /// to zero (the caller checks all three before triggering notification).
    pub fn release_reference_owning_thread(&mut self, block_index: usize, zone: ZoneType) -> Result<()> {
        let block = self
            .blocks
            .get_mut(block_index)
            .ok_or_else(|| VdoError::assertion(format!("invalid journal block index {block_index}")))?;
        match zone {
            ZoneType::Logical(z) => {
                let slot = block
                    .logical_zone_counts
                    .get_mut(z as usize)
                    .ok_or_else(|| VdoError::assertion(format!("invalid logical zone {z}")))?;
                if *slot == 0 {
                    return Err(VdoError::assertion(format!(
                        "logical zone {z} lock underflow on block {block_index}"
                    )));
                }
                *slot -= 1;
                let prev = block.logical_total.fetch_sub(1, Ordering::AcqRel);
                if prev == 0 {
                    return Err(VdoError::assertion("logical zone total underflow"));
                }
            }
            ZoneType::Physical(z) => {
                let slot = block
                    .physical_zone_counts
                    .get_mut(z as usize)
                    .ok_or_else(|| VdoError::assertion(format!("invalid physical zone {z}")))?;
                if *slot == 0 {
                    return Err(VdoError::assertion(format!(
                        "physical zone {z} lock underflow on block {block_index}"
                    )));
                }
                *slot -= 1;
                let prev = block.physical_total.fetch_sub(1, Ordering::AcqRel);
                if prev == 0 {
                    return Err(VdoError::assertion("physical zone total underflow"));
                }
            }
            ZoneType::Journal => {
                self.drain_journal_decrements(block_index)?;
                let block = &mut self.blocks[block_index];
                if block.journal_count == 0 {
                    return Err(VdoError::assertion(format!(
                        "journal zone lock underflow on block {block_index}"
                    )));
                }
                block.journal_count -= 1;
                let prev = block.journal_total.fetch_sub(1, Ordering::AcqRel);
                if prev == 0 {
                    return Err(VdoError::assertion("journal zone total underflow"));
                }
            }
        }
        self.maybe_notify(block_index)?;
        Ok(())
    }

    /// Release of the journal zone's reference from a non-journal thread:
    /// only the atomic batched counter is touched; the real subtraction from
    /// `journal_count` happens lazily the next time the journal thread
    /// touches this block (spec §4.5: "Decrements ... originate on a
    /// non-journal thread are batched into a per-block atomic
    /// `journal_decrement_counts`, then subtracted on the journal thread").
    pub fn release_reference_other_thread(&self, block_index: usize) -> Result<()> {
        let block = self.block(block_index)?;
        block.journal_decrement_counts.fetch_add(1, Ordering::AcqRel);
        block.journal_total.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Subtract any batched cross-thread decrements into the journal-owned
    /// counter. Must run on the journal thread; asserts decrements never
    /// exceed the current value (spec §4.5's fatal underflow check).
    fn drain_journal_decrements(&mut self, block_index: usize) -> Result<()> {
        let block = &mut self.blocks[block_index];
        let pending = block.journal_decrement_counts.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return Ok(());
        }
        if pending as u32 > block.journal_count as u32 {
            return Err(VdoError::assertion(format!(
                "journal decrement count {pending} exceeds journal value {} on block {block_index}",
                block.journal_count
            )));
        }
        block.journal_count -= pending as u16;
        Ok(())
    }

    /// After any release, check whether the block became fully unlocked and
    /// if so flip `idle -> notifying`, coalescing repeated triggers via CAS.
    fn maybe_notify(&self, block_index: usize) -> Result<()> {
        let block = self.block(block_index)?;
        if block.is_unlocked() {
            // Only the first releaser to observe all-zero flips the flag;
            // later callers on an already-notifying counter are absorbed.
            let _ = self.notifying.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
        }
        Ok(())
    }

    /// Whether a reclaim notification is currently pending for the journal
    /// thread to act on.
    pub fn is_notifying(&self) -> bool {
        self.notifying.load(Ordering::Acquire)
    }

    /// Called by the journal thread after acting on a notification. Clears
    /// the flag back to `idle`; the journal thread is expected to re-scan
    /// for any block that is now unlocked, since further releases may have
    /// been absorbed while `notifying` was set.
    pub fn acknowledge_unlock(&self) {
        self.notifying.store(false, Ordering::Release);
    }

    pub fn is_locked(&self, block_index: usize) -> Result<bool> {
        Ok(!self.block(block_index)?.is_unlocked())
    }

    pub fn logical_zones(&self) -> usize {
        self.logical_zones
    }

    pub fn physical_zones(&self) -> usize {
        self.physical_zones
    }
}
