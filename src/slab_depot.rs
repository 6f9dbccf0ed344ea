//! Slab depot and per-zone block allocators (spec §3, §4.4).
//!
//! The depot owns a single flat array of slabs so that `PBN -> slab number`
//! is pure arithmetic; each physical zone then owns a disjoint subset of
//! those slabs (by `slab_number % physical_zones`, matching spec §5's
//! "PBN -> zone by slab number") and runs its own allocation priority queue.

use std::collections::{BinaryHeap, VecDeque};

use crate::error::{Result, VdoError};
use crate::slab::Slab;
use crate::types::Pbn;

/// Ordering key for the allocator's priority queue: most-free-blocks first,
/// ties broken by lowest slab number (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlabPriority {
    free_blocks: u64,
    slab_number: u32,
}

impl Ord for SlabPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.free_blocks
            .cmp(&other.free_blocks)
            .then_with(|| other.slab_number.cmp(&self.slab_number))
    }
}

impl PartialOrd for SlabPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A waiter blocked on `OUT_OF_SPACE`, released in FIFO order once a refcount
/// in this zone goes to zero (spec §4.4).
pub struct AllocationWaiter {
    pub data_vio_id: u32,
}

pub struct BlockAllocator {
    pub zone_number: u32,
    /// Slab numbers owned by this zone, in priority order by free count.
    priority_queue: BinaryHeap<SlabPriority>,
    /// Slabs currently under scrubbing: excluded from the priority queue
    /// until scrubbing completes (spec §4.4).
    pending_scrub: Vec<u32>,
    wait_queue: VecDeque<AllocationWaiter>,
}

impl BlockAllocator {
    fn new(zone_number: u32) -> Self {
        Self {
            zone_number,
            priority_queue: BinaryHeap::new(),
            pending_scrub: Vec::new(),
            wait_queue: VecDeque::new(),
        }
    }

    fn note_slab(&mut self, slab_number: u32, free_blocks: u64, scrubbing: bool) {
        if scrubbing {
            self.pending_scrub.push(slab_number);
        } else {
            self.priority_queue.push(SlabPriority { free_blocks, slab_number });
        }
    }

    /// Re-insert a slab after its free-block count changed, e.g. following a
    /// decrement that freed a block. `BinaryHeap` doesn't support decrease-key
    /// in place, so entries are re-pushed; stale entries are filtered out
    /// lazily in `pop_best` by checking against the slab's live free count.
    fn requeue(&mut self, slab_number: u32, free_blocks: u64) {
        self.priority_queue.push(SlabPriority { free_blocks, slab_number });
    }

    pub fn push_waiter(&mut self, waiter: AllocationWaiter) {
        self.wait_queue.push_back(waiter);
    }

    pub fn pop_waiter(&mut self) -> Option<AllocationWaiter> {
        self.wait_queue.pop_front()
    }

    pub fn has_waiters(&self) -> bool {
        !self.wait_queue.is_empty()
    }
}

pub struct SlabDepot {
    pub slabs: Vec<Slab>,
    pub origin: Pbn,
    pub slab_blocks: u64,
    allocators: Vec<BlockAllocator>,
}

impl SlabDepot {
    pub fn new(origin: Pbn, slab_count: u64, slab_blocks: u64, physical_zones: u32, journal_entries_per_block: usize) -> Self {
        let mut slabs = Vec::with_capacity(slab_count as usize);
        for i in 0..slab_count {
            let start = Pbn::new(origin.as_u64() + i * slab_blocks).expect("slab start in range");
            slabs.push(Slab::new(i as u32, start, slab_blocks, journal_entries_per_block));
        }

        let mut allocators: Vec<BlockAllocator> =
            (0..physical_zones).map(BlockAllocator::new).collect();

        for slab in &slabs {
            let zone = Self::zone_for_slab(slab.slab_number, physical_zones);
            allocators[zone as usize].note_slab(slab.slab_number, slab.free_block_count(), false);
        }

        Self { slabs, origin, slab_blocks, allocators }
    }

    pub fn zone_for_slab(slab_number: u32, physical_zones: u32) -> u32 {
        slab_number % physical_zones
    }

    pub fn slab_number_for(&self, pbn: Pbn) -> Result<u32> {
        if pbn.is_zero_block() {
            return Err(VdoError::assertion("zero block has no slab"));
        }
        let offset = pbn
            .as_u64()
            .checked_sub(self.origin.as_u64())
            .ok_or_else(|| VdoError::OutOfRange { what: "pbn", value: pbn.as_u64() })?;
        let slab_number = offset / self.slab_blocks;
        if slab_number >= self.slabs.len() as u64 {
            return Err(VdoError::OutOfRange { what: "pbn", value: pbn.as_u64() });
        }
        Ok(slab_number as u32)
    }

    pub fn slab(&self, slab_number: u32) -> Result<&Slab> {
        self.slabs
            .get(slab_number as usize)
            .ok_or_else(|| VdoError::assertion(format!("invalid slab index {slab_number}")))
    }

    pub fn slab_mut(&mut self, slab_number: u32) -> Result<&mut Slab> {
        self.slabs
            .get_mut(slab_number as usize)
            .ok_or_else(|| VdoError::assertion(format!("invalid slab index {slab_number}")))
    }

    pub fn slab_for_pbn(&self, pbn: Pbn) -> Result<&Slab> {
        let n = self.slab_number_for(pbn)?;
        self.slab(n)
    }

    pub fn slab_for_pbn_mut(&mut self, pbn: Pbn) -> Result<&mut Slab> {
        let n = self.slab_number_for(pbn)?;
        self.slab_mut(n)
    }

    /// Allocate a PBN from the given physical zone's allocator: pop the
    /// head (most-free) slab, claim its next free block, and reinsert the
    /// slab at its updated priority. Returns `OUT_OF_SPACE` if every slab in
    /// this zone is full or scrubbing (spec §4.4).
    pub fn allocate(&mut self, zone: u32) -> Result<Pbn> {
        loop {
            let candidate = {
                let allocator = &mut self.allocators[zone as usize];
                allocator.priority_queue.pop()
            };

            let Some(candidate) = candidate else {
                return Err(VdoError::OutOfSpace { zone });
            };

            let slab = self.slab_mut(candidate.slab_number)?;
            // Stale heap entry: the slab's free count has since changed.
            // Skip it; the live value was already pushed under a fresh entry.
            if slab.free_block_count() != candidate.free_blocks {
                continue;
            }
            if !slab.admin_state.can_allocate() {
                continue;
            }

            let Some(offset) = slab.reference_counts.allocate_next_free() else {
                continue;
            };
            let pbn = Pbn::new(slab.start.as_u64() + offset as u64)?;

            let new_free = slab.free_block_count();
            self.allocators[zone as usize].requeue(candidate.slab_number, new_free);
            return Ok(pbn);
        }
    }

    /// Notify the allocator owning `slab_number` that a free-block count
    /// changed, so the slab's position in the priority queue stays current.
    pub fn note_free_count_changed(&mut self, slab_number: u32, physical_zones: u32) {
        let zone = Self::zone_for_slab(slab_number, physical_zones);
        if let Ok(slab) = self.slab(slab_number) {
            let free = slab.free_block_count();
            self.allocators[zone as usize].requeue(slab_number, free);
        }
    }

    pub fn allocator_mut(&mut self, zone: u32) -> &mut BlockAllocator {
        &mut self.allocators[zone as usize]
    }

    pub fn slab_count(&self) -> u64 {
        self.slabs.len() as u64
    }

    /// Append slabs to cover `new_slab_count` total, registering each new
    /// slab with its owning zone's allocator (spec §6 admin surface's
    /// `prepare_to_grow` / `use_new_slabs`). Returns the range of newly
    /// created slab numbers so the caller can load them.
    pub fn grow(
        &mut self,
        new_slab_count: u64,
        journal_entries_per_block: usize,
        physical_zones: u32,
    ) -> std::ops::Range<u32> {
        let first_new = self.slabs.len() as u64;
        for i in first_new..new_slab_count {
            let start = Pbn::new(self.origin.as_u64() + i * self.slab_blocks).expect("slab start in range");
            let slab = Slab::new(i as u32, start, self.slab_blocks, journal_entries_per_block);
            let zone = Self::zone_for_slab(slab.slab_number, physical_zones);
            self.allocators[zone as usize].note_slab(slab.slab_number, slab.free_block_count(), false);
            self.slabs.push(slab);
        }
        (first_new as u32)..(self.slabs.len() as u32)
    }
}
