//! Data VIO: the in-flight state of one block-granularity user I/O (spec
//! §3, §4.8), plus the fixed-size pool it is acquired from and released to.
//!
//! The compression status machine is modeled as a plain enum whose variant
//! order is itself the allowed progression, per spec §4.8 and the Design
//! Notes' "dynamic dispatch / completions" guidance (a tagged state, not a
//! function-pointer completion).

use std::time::Instant;

use crossbeam::queue::ArrayQueue;

use crate::error::VdoError;
use crate::types::{BlockMapEntry, Fingerprint, Lbn, Pbn, VDO_BLOCK_SIZE};

/// Kind of operation this VIO is carrying out (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioOperation {
    Read,
    Write,
    ReadModifyWrite,
    Trim,
}

/// Compression status machine (spec §4.8):
///
/// ```text
/// PreCompressor -> Compressing -> Packing -> PostPacker
///                       |            |
///                       +------------+---> PostPacker (uncompressible, cancelled, or discard)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompressionStatus {
    PreCompressor,
    Compressing,
    Packing,
    PostPacker,
}

/// A data VIO's compression bookkeeping (spec §3's "compression record").
#[derive(Debug, Clone)]
pub struct CompressionState {
    pub status: CompressionStatus,
    pub compressed_size: Option<usize>,
    pub compressed_fragment: Option<Vec<u8>>,
    /// Sticky flag: once true, this VIO must never (re-)enter compression,
    /// even if it is currently mid-flight in the packer (spec §3, §4.8).
    pub may_not_compress: bool,
    /// Set by the first caller of `cancel_compression` while `Packing`.
    pub cancelled: bool,
}

impl Default for CompressionState {
    fn default() -> Self {
        Self {
            status: CompressionStatus::PreCompressor,
            compressed_size: None,
            compressed_fragment: None,
            may_not_compress: false,
            cancelled: false,
        }
    }
}

impl CompressionState {
    /// `true` iff status == PRE and `may_not_compress` is false (spec §4.8).
    pub fn may_compress(&self) -> bool {
        self.status == CompressionStatus::PreCompressor && !self.may_not_compress
    }

    /// `true` iff status == COMPRESSING and no cancellation observed.
    pub fn may_pack(&self) -> bool {
        self.status == CompressionStatus::Compressing && !self.cancelled
    }

    /// `true` iff status == PACKING and not cancelled. After this returns
    /// true, any cancellation must go through `cancel_compression` rather
    /// than setting `cancelled` directly (spec §4.8).
    pub fn may_block_in_packer(&self) -> bool {
        self.status == CompressionStatus::Packing && !self.cancelled
    }

    pub fn advance_to_compressing(&mut self) {
        debug_assert_eq!(self.status, CompressionStatus::PreCompressor);
        self.status = CompressionStatus::Compressing;
    }

    pub fn advance_to_packing(&mut self) {
        debug_assert_eq!(self.status, CompressionStatus::Compressing);
        self.status = CompressionStatus::Packing;
    }

    /// Terminal transition from any state: uncompressible data, a
    /// cancellation, or a discard all land here (spec §4.8's diagram).
    pub fn advance_to_post_packer(&mut self) {
        self.status = CompressionStatus::PostPacker;
    }
}

/// The allocation a write has claimed from a physical zone's allocator
/// (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub pbn: Pbn,
    pub slab_number: u32,
}

/// The in-flight state of one block's I/O request (spec §3).
pub struct DataVio {
    pub id: u32,
    pub lbn: Lbn,
    pub arrival: Instant,
    pub operation: VioOperation,
    pub mapped: BlockMapEntry,
    pub new_mapped: BlockMapEntry,
    pub fingerprint: Option<Fingerprint>,
    pub allocation: Option<Allocation>,
    pub compression: CompressionState,
    pub duplicate_candidate: Option<Pbn>,
    pub is_zero_block: bool,
    pub is_duplicate: bool,
    pub is_partial: bool,
    /// The VIO's owned 4 KiB data buffer (spec §3: "copy user data into the
    /// VIO's owned buffer").
    pub buffer: Box<[u8; VDO_BLOCK_SIZE]>,
    /// For a discard that crosses block boundaries: the count of sibling
    /// discard VIOs still outstanding. The discard is acknowledged only
    /// when this reaches zero (spec §4.8).
    pub remaining_discard: u32,
    pub result: Option<VdoError>,
}

impl DataVio {
    fn new(id: u32) -> Self {
        Self {
            id,
            lbn: Lbn::new(0).unwrap(),
            arrival: Instant::now(),
            operation: VioOperation::Read,
            mapped: BlockMapEntry::UNMAPPED,
            new_mapped: BlockMapEntry::UNMAPPED,
            fingerprint: None,
            allocation: None,
            compression: CompressionState::default(),
            duplicate_candidate: None,
            is_zero_block: false,
            is_duplicate: false,
            is_partial: false,
            buffer: Box::new([0u8; VDO_BLOCK_SIZE]),
            remaining_discard: 0,
            result: None,
        }
    }

    /// Reset all per-request state before handing this slot back out to a
    /// new ingress request (spec §3: a data VIO is released only after
    /// acknowledgement and reused from the pool).
    fn reset(&mut self, lbn: Lbn, operation: VioOperation, arrival: Instant) {
        self.lbn = lbn;
        self.arrival = arrival;
        self.operation = operation;
        self.mapped = BlockMapEntry::UNMAPPED;
        self.new_mapped = BlockMapEntry::UNMAPPED;
        self.fingerprint = None;
        self.allocation = None;
        self.compression = CompressionState::default();
        self.duplicate_candidate = None;
        self.is_zero_block = false;
        self.is_duplicate = false;
        self.is_partial = false;
        self.buffer.fill(0);
        self.remaining_discard = 0;
        self.result = None;
    }

    /// Zero-fill the owned buffer, then copy `written` into `offset..`.
    /// Used by partial-block writes before hashing (spec §4.8/§9's
    /// "partial-block zero-fill" supplement): two RMWs that differ only
    /// outside the written range must still dedupe correctly, which
    /// requires the unwritten bytes to be deterministically zero rather
    /// than carrying over whatever the buffer previously held.
    pub fn apply_partial_write(&mut self, offset: usize, written: &[u8]) {
        self.buffer.fill(0);
        self.buffer[offset..offset + written.len()].copy_from_slice(written);
        self.is_partial = true;
    }
}

/// Fixed-size, preallocated pool of data VIOs (spec §3, §5). Acquisition is
/// lock-free via a `crossbeam::queue::ArrayQueue` free list of indices;
/// the VIOs themselves live in a `Vec` indexed by that same id, matching
/// spec §5's "allocation is lock-free (a per-CPU free list)".
pub struct DataVioPool {
    slots: Vec<parking_lot::Mutex<DataVio>>,
    free_list: ArrayQueue<u32>,
    gate: crate::gate::Gate,
}

impl DataVioPool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|i| parking_lot::Mutex::new(DataVio::new(i as u32))).collect();
        let free_list = ArrayQueue::new(capacity);
        for i in 0..capacity as u32 {
            free_list.push(i).expect("freshly sized queue has room for every slot");
        }
        Self { slots, free_list, gate: crate::gate::Gate::new() }
    }

    /// Block until a slot is available (spec §4.8 step 1's request
    /// limiter). Callers that must not block (e.g. a non-blocking ingress
    /// path) should use `try_acquire` directly instead.
    pub fn acquire_blocking(&self, lbn: Lbn, operation: VioOperation, arrival: Instant) -> u32 {
        loop {
            if let Some(id) = self.try_acquire(lbn, operation, arrival) {
                return id;
            }
            self.gate.wait();
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Acquire a VIO slot for a new request, or `None` if the pool is
    /// momentarily exhausted (the caller then applies admission-control
    /// backpressure per spec §4.8 step 1).
    pub fn try_acquire(&self, lbn: Lbn, operation: VioOperation, arrival: Instant) -> Option<u32> {
        let id = self.free_list.pop()?;
        self.slots[id as usize].lock().reset(lbn, operation, arrival);
        Some(id)
    }

    pub fn with_vio<R>(&self, id: u32, f: impl FnOnce(&mut DataVio) -> R) -> R {
        f(&mut self.slots[id as usize].lock())
    }

    /// Release a VIO back to the pool after its bio has been acknowledged
    /// and the pipeline has quiesced (spec §3).
    pub fn release(&self, id: u32) {
        self.free_list.push(id).expect("released id cannot exceed pool capacity");
        self.gate.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn may_compress_requires_pre_state_and_not_sticky() {
        let mut state = CompressionState::default();
        assert!(state.may_compress());
        state.may_not_compress = true;
        assert!(!state.may_compress());
    }

    #[test]
    fn status_progression_gates_each_flag() {
        let mut state = CompressionState::default();
        state.advance_to_compressing();
        assert!(!state.may_compress());
        assert!(state.may_pack());
        state.advance_to_packing();
        assert!(!state.may_pack());
        assert!(state.may_block_in_packer());
        state.cancelled = true;
        assert!(!state.may_block_in_packer());
    }

    #[test]
    fn pool_acquire_release_round_trips_and_resets_state() {
        let pool = DataVioPool::new(2);
        assert_eq!(pool.available(), 2);
        let id = pool.try_acquire(Lbn::new(3).unwrap(), VioOperation::Write, Instant::now()).unwrap();
        assert_eq!(pool.available(), 1);
        pool.with_vio(id, |vio| vio.is_duplicate = true);
        pool.release(id);
        assert_eq!(pool.available(), 2);
        let id2 = pool.try_acquire(Lbn::new(9).unwrap(), VioOperation::Read, Instant::now()).unwrap();
        pool.with_vio(id2, |vio| assert!(!vio.is_duplicate));
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let pool = DataVioPool::new(1);
        let _id = pool.try_acquire(Lbn::new(0).unwrap(), VioOperation::Read, Instant::now()).unwrap();
        assert!(pool.try_acquire(Lbn::new(1).unwrap(), VioOperation::Read, Instant::now()).is_none());
    }

    #[test]
    fn partial_write_zero_fills_unwritten_range() {
        let mut vio = DataVio::new(0);
        vio.buffer.fill(0xFF);
        vio.apply_partial_write(10, &[1, 2, 3]);
        assert_eq!(&vio.buffer[0..10], &[0u8; 10]);
        assert_eq!(&vio.buffer[10..13], &[1, 2, 3]);
        assert!(vio.buffer[13..].iter().all(|&b| b == 0));
    }
}
