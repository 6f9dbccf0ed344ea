//! Packer: bins compressed fragments from distinct LBNs into one shared
//! physical block (spec §4.6).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::types::MAX_COMPRESSION_SLOTS;

/// A compressed fragment waiting to be packed, identified by its owning
/// data VIO.
#[derive(Debug, Clone)]
pub struct PendingFragment {
    pub data_vio_id: u32,
    pub compressed: Vec<u8>,
    /// Sticky flag mirrored from the data VIO: if this becomes true while
    /// still in the bin, the fragment is released on the uncompressed path
    /// instead of being written (spec §4.6).
    pub may_not_compress: bool,
}

/// One in-progress bin: up to [`MAX_COMPRESSION_SLOTS`] fragments destined
/// for the same shared physical block.
pub struct Bin {
    fragments: Vec<PendingFragment>,
    opened_at: Instant,
    /// VIOs that were the first to call `cancel_compression` on themselves
    /// while `PACKING`; they inherit responsibility for flushing the bin
    /// if it is abandoned rather than filled (spec §4.6's cancellation
    /// contract).
    cancelled: Vec<u32>,
}

impl Bin {
    fn new(now: Instant) -> Self {
        Self { fragments: Vec::with_capacity(MAX_COMPRESSION_SLOTS as usize), opened_at: now, cancelled: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn remaining_capacity(&self, bins_full_threshold: u8) -> usize {
        (bins_full_threshold as usize).saturating_sub(self.fragments.len())
    }

    pub fn fragments(&self) -> &[PendingFragment] {
        &self.fragments
    }
}

/// Outcome of adding a fragment to the packer.
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// Still accumulating; the fragment joined `bin_id`.
    Accumulating { bin_id: u64 },
    /// The bin reached capacity and is ready to be written as one shared
    /// block; here are its fragment slots in the order they fill
    /// `COMPRESSED_BASE+k`.
    Full { bin_id: u64, fragments: Vec<PendingFragment> },
}

/// Accumulates compressed fragments across possibly-many concurrently-open
/// bins (spec §4.6). A bin closes either when it reaches
/// `bins_full_threshold` distinct LBNs or when `flush_interval` elapses
/// since it was opened.
pub struct Packer {
    bins_full_threshold: u8,
    flush_interval: Duration,
    open_bins: VecDeque<(u64, Bin)>,
    next_bin_id: u64,
}

impl Packer {
    pub fn new(bins_full_threshold: u8, flush_interval: Duration) -> Self {
        Self {
            bins_full_threshold: bins_full_threshold.min(MAX_COMPRESSION_SLOTS),
            flush_interval,
            open_bins: VecDeque::new(),
            next_bin_id: 0,
        }
    }

    /// Add a compressed fragment, opening a new bin if none has room. `now`
    /// is passed in rather than read from the clock so the packer's flush
    /// timing is deterministically testable.
    pub fn add_fragment(&mut self, fragment: PendingFragment, now: Instant) -> AddOutcome {
        if self.open_bins.is_empty() || self.open_bins.back().unwrap().1.remaining_capacity(self.bins_full_threshold) == 0 {
            let id = self.next_bin_id;
            self.next_bin_id += 1;
            self.open_bins.push_back((id, Bin::new(now)));
        }
        let (bin_id, bin) = self.open_bins.back_mut().unwrap();
        let bin_id = *bin_id;
        bin.fragments.push(fragment);

        if bin.len() >= self.bins_full_threshold as usize {
            let (_, bin) = self.open_bins.pop_back().unwrap();
            return AddOutcome::Full { bin_id, fragments: bin.fragments };
        }
        AddOutcome::Accumulating { bin_id }
    }

    /// Called periodically (or driven by a test clock) to force-flush any
    /// bin whose flush interval has elapsed, even if not full (spec §5's
    /// "packer has a bounded timer"). Returns the flushed bins.
    pub fn expire_timed_out_bins(&mut self, now: Instant) -> Vec<(u64, Vec<PendingFragment>)> {
        let mut flushed = Vec::new();
        let mut still_open = VecDeque::new();
        while let Some((id, bin)) = self.open_bins.pop_front() {
            if !bin.is_empty() && now.duration_since(bin.opened_at) >= self.flush_interval {
                flushed.push((id, bin.fragments));
            } else {
                still_open.push_back((id, bin));
            }
        }
        self.open_bins = still_open;
        flushed
    }

    /// Remove a single VIO from whichever bin holds it because its
    /// `may_not_compress` flag flipped true — released on the uncompressed
    /// path without disturbing the other participants (spec §4.6).
    pub fn remove_vio_for_uncompressible_release(&mut self, data_vio_id: u32) -> bool {
        for (_, bin) in self.open_bins.iter_mut() {
            if let Some(pos) = bin.fragments.iter().position(|f| f.data_vio_id == data_vio_id) {
                bin.fragments.remove(pos);
                return true;
            }
        }
        false
    }

    /// `cancel_compression` contract (spec §4.6): returns `true` iff the
    /// caller is the first to cancel `data_vio_id` while it is in some bin.
    /// The first canceller inherits responsibility for flushing that bin's
    /// remaining partial contents.
    pub fn cancel_compression(&mut self, data_vio_id: u32) -> bool {
        for (_, bin) in self.open_bins.iter_mut() {
            if bin.fragments.iter().any(|f| f.data_vio_id == data_vio_id) {
                if bin.cancelled.contains(&data_vio_id) {
                    return false;
                }
                bin.cancelled.push(data_vio_id);
                return true;
            }
        }
        false
    }

    pub fn open_bin_count(&self) -> usize {
        self.open_bins.len()
    }
}
