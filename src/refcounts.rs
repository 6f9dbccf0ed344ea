//! Per-slab reference counts (spec §4.2).
//!
//! One byte per physical block within the slab: `0` = free, `1..=254` = that
//! many LBNs reference the block, `255` = `PROVISIONAL` (claimed by an
//! in-flight data VIO but not yet committed). A saturated count of 254 is a
//! pessimistic lower bound; the true count is only recoverable by replaying
//! the slab journal (spec §9's "saturating refcounts" note) — a saturated
//! block is therefore never considered free until a journal replay restores
//! the exact count.

use crate::error::{Result, VdoError};
use crate::types::Pbn;

pub const PROVISIONAL: u8 = 255;
pub const MAX_REAL_COUNT: u8 = 254;

/// Output of an increment/decrement telling the caller whether the block's
/// free/non-free status flipped, which the slab depot uses to reposition the
/// slab in the allocator's priority queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefCountDelta {
    pub free_changed: bool,
}

pub struct ReferenceCounts {
    /// Byte-per-block counters, indexed by block offset within the slab.
    counts: Vec<u8>,
    /// Count of blocks whose counter is 0, kept incrementally rather than
    /// recomputed from `counts` on every mutation.
    free_blocks: u64,
    /// Circular cursor used by `allocate_next_free` to avoid rescanning from
    /// the start of the slab on every allocation.
    search_cursor: usize,
    /// Whether any counter has saturated; once true this slab's refcounts
    /// can't be trusted for `OUT_OF_SPACE` decisions until scrubbed.
    has_saturated: bool,
    /// Live fragment slots for a compressed block, keyed by block offset.
    /// Tracks how many of the up to 14 fragment-holders in a shared
    /// compressed block are still referenced.
    fragment_counts: std::collections::HashMap<usize, u8>,
}

impl ReferenceCounts {
    pub fn new(block_count: usize) -> Self {
        Self {
            counts: vec![0u8; block_count],
            free_blocks: block_count as u64,
            search_cursor: 0,
            has_saturated: false,
            fragment_counts: std::collections::HashMap::new(),
        }
    }

    pub fn block_count(&self) -> usize {
        self.counts.len()
    }

    pub fn free_block_count(&self) -> u64 {
        self.free_blocks
    }

    fn get(&self, offset: usize) -> Result<u8> {
        self.counts
            .get(offset)
            .copied()
            .ok_or_else(|| VdoError::assertion(format!("refcount offset {offset} out of range")))
    }

    /// Increment the count at `offset`. Saturates at 254 -> 255 ("many");
    /// an increment on an already-saturated counter is a silent no-op, as
    /// the true value can only be restored by journal replay.
    pub fn increment(&mut self, offset: usize) -> Result<RefCountDelta> {
        let before = self.get(offset)?;
        let free_changed = before == 0;

        let after = match before {
            0 => 1,
            PROVISIONAL => {
                self.has_saturated = true;
                PROVISIONAL
            }
            MAX_REAL_COUNT => {
                self.has_saturated = true;
                PROVISIONAL
            }
            n => n + 1,
        };

        self.counts[offset] = after;
        if free_changed {
            self.free_blocks -= 1;
        }
        Ok(RefCountDelta { free_changed })
    }

    /// Decrement the count at `offset`. A decrement on a zero count is
    /// fatal (spec §4.2): the caller must drive the device read-only.
    pub fn decrement(&mut self, offset: usize) -> Result<RefCountDelta> {
        let before = self.get(offset)?;
        if before == 0 {
            log::warn!("refcount underflow decrementing already-free block at offset {offset}");
            return Err(VdoError::assertion(format!(
                "refcount underflow decrementing offset {offset}"
            )));
        }

        let after = if before == PROVISIONAL {
            // A saturated/provisional count can't be decremented precisely;
            // it stays pessimistically non-zero until scrubbed.
            PROVISIONAL
        } else {
            before - 1
        };

        self.counts[offset] = after;
        let free_changed = after == 0;
        if free_changed {
            self.free_blocks += 1;
        }
        Ok(RefCountDelta { free_changed })
    }

    /// Claim `offset` provisionally for an allocating data VIO. Fails with
    /// `EXISTS` (modeled as `Err`) if the block is already non-free.
    pub fn provisional_claim(&mut self, offset: usize) -> Result<()> {
        let before = self.get(offset)?;
        if before != 0 {
            return Err(VdoError::assertion(format!(
                "provisional_claim on non-free offset {offset} (count={before})"
            )));
        }
        self.counts[offset] = PROVISIONAL;
        self.free_blocks -= 1;
        Ok(())
    }

    /// Find and provisionally claim the next free block starting from the
    /// circular search cursor, per spec §4.4.
    pub fn allocate_next_free(&mut self) -> Option<usize> {
        let len = self.counts.len();
        if len == 0 {
            return None;
        }
        for step in 0..len {
            let offset = (self.search_cursor + step) % len;
            if self.counts[offset] == 0 {
                self.counts[offset] = PROVISIONAL;
                self.free_blocks -= 1;
                self.search_cursor = (offset + 1) % len;
                return Some(offset);
            }
        }
        None
    }

    /// Commit a provisional claim into a real single reference, once the
    /// block-map/journal writes for it are durable.
    pub fn commit_provisional(&mut self, offset: usize) -> Result<()> {
        let before = self.get(offset)?;
        if before != PROVISIONAL {
            return Err(VdoError::assertion(format!(
                "commit_provisional on non-provisional offset {offset}"
            )));
        }
        self.counts[offset] = 1;
        Ok(())
    }

    /// Release a provisional claim that was never committed, e.g. when a
    /// write discovers after allocating its own block that it will instead
    /// be packed into someone else's shared compressed block.
    pub fn cancel_provisional(&mut self, offset: usize) -> Result<()> {
        let before = self.get(offset)?;
        if before != PROVISIONAL {
            return Err(VdoError::assertion(format!(
                "cancel_provisional on non-provisional offset {offset}"
            )));
        }
        self.counts[offset] = 0;
        self.free_blocks += 1;
        Ok(())
    }

    pub fn raw_count(&self, offset: usize) -> Result<u8> {
        self.get(offset)
    }

    pub fn set_raw_count(&mut self, offset: usize, value: u8) -> Result<()> {
        let before = self.get(offset)?;
        let was_free = before == 0;
        let is_free = value == 0;
        self.counts[offset] = value;
        if was_free && !is_free {
            self.free_blocks -= 1;
        } else if !was_free && is_free {
            self.free_blocks += 1;
        }
        Ok(())
    }

    /// Number of live fragment-holders for a shared compressed block at
    /// `offset`. Defaults to 0 (not a compressed block, or fully released).
    pub fn fragment_count(&self, offset: usize) -> u8 {
        self.fragment_counts.get(&offset).copied().unwrap_or(0)
    }

    pub fn increment_fragment(&mut self, offset: usize) {
        *self.fragment_counts.entry(offset).or_insert(0) += 1;
    }

    /// Returns true if the fragment-holder count reached zero, meaning the
    /// shared compressed block is no longer referenced by any LBN.
    pub fn decrement_fragment(&mut self, offset: usize) -> Result<bool> {
        let entry = self
            .fragment_counts
            .get_mut(&offset)
            .ok_or_else(|| VdoError::assertion(format!("fragment underflow at offset {offset}")))?;
        if *entry == 0 {
            return Err(VdoError::assertion(format!("fragment underflow at offset {offset}")));
        }
        *entry -= 1;
        let drained = *entry == 0;
        if drained {
            self.fragment_counts.remove(&offset);
        }
        Ok(drained)
    }

    pub fn has_saturated_counter(&self) -> bool {
        self.has_saturated
    }
}

/// Translate an absolute PBN to its offset within a slab starting at `origin`.
pub fn offset_within_slab(pbn: Pbn, origin: Pbn, slab_blocks: u64) -> usize {
    ((pbn.as_u64() - origin.as_u64()) % slab_blocks) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_from_zero_marks_free_changed() {
        let mut rc = ReferenceCounts::new(4);
        let delta = rc.increment(0).unwrap();
        assert!(delta.free_changed);
        assert_eq!(rc.free_block_count(), 3);
    }

    #[test]
    fn decrement_to_zero_marks_free_changed() {
        let mut rc = ReferenceCounts::new(4);
        rc.increment(0).unwrap();
        rc.increment(0).unwrap();
        let delta = rc.decrement(0).unwrap();
        assert!(!delta.free_changed);
        let delta = rc.decrement(0).unwrap();
        assert!(delta.free_changed);
    }

    #[test]
    fn decrement_underflow_is_fatal() {
        let mut rc = ReferenceCounts::new(4);
        assert!(rc.decrement(0).is_err());
    }

    #[test]
    fn increment_saturates_at_254_to_provisional_marker() {
        let mut rc = ReferenceCounts::new(1);
        for _ in 0..254 {
            rc.increment(0).unwrap();
        }
        assert_eq!(rc.raw_count(0).unwrap(), MAX_REAL_COUNT);
        rc.increment(0).unwrap();
        assert_eq!(rc.raw_count(0).unwrap(), PROVISIONAL);
        assert!(rc.has_saturated_counter());
    }

    #[test]
    fn allocate_next_free_advances_circular_cursor() {
        let mut rc = ReferenceCounts::new(3);
        let a = rc.allocate_next_free().unwrap();
        let b = rc.allocate_next_free().unwrap();
        let c = rc.allocate_next_free().unwrap();
        assert_eq!([a, b, c], [0, 1, 2]);
        assert!(rc.allocate_next_free().is_none());
    }

    #[test]
    fn provisional_claim_fails_on_nonfree_block() {
        let mut rc = ReferenceCounts::new(1);
        rc.provisional_claim(0).unwrap();
        assert!(rc.provisional_claim(0).is_err());
    }

    #[test]
    fn cancel_provisional_frees_the_block_back() {
        let mut rc = ReferenceCounts::new(1);
        rc.provisional_claim(0).unwrap();
        assert_eq!(rc.free_block_count(), 0);
        rc.cancel_provisional(0).unwrap();
        assert_eq!(rc.free_block_count(), 1);
        assert_eq!(rc.raw_count(0).unwrap(), 0);
    }
}
