//! A single slab: a fixed-size range of physical blocks with its own
//! append-only journal and reference-counts metadata (spec §3, §4.3).

use std::collections::VecDeque;

use crate::error::{Result, VdoError};
use crate::refcounts::{self, ReferenceCounts};
use crate::types::Pbn;

/// A point in the recovery journal's total order: the sequence number of the
/// journal block plus the index of the entry within it. Used to order slab
/// journal entries and to decide which recovery journal blocks a slab
/// journal still depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalPoint {
    pub sequence_number: u64,
    pub entry_count: u16,
}

/// Slab journal entry operation (spec §6: on-disk encoding is
/// `(operation:1, slab_block_number:3, sequenceNumber:8 LE)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlabJournalOperation {
    Increment = 0,
    Decrement = 1,
    IncrementForCompressedFragment = 2,
}

impl SlabJournalOperation {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Increment),
            1 => Ok(Self::Decrement),
            2 => Ok(Self::IncrementForCompressedFragment),
            other => Err(VdoError::assertion(format!("invalid slab journal op byte {other}"))),
        }
    }
}

/// One entry in the append-only slab journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub operation: SlabJournalOperation,
    /// Offset of the affected block within the slab (fits in 3 bytes: up to
    /// 2^24 blocks per slab, comfortably above any realistic slab size).
    pub slab_block_offset: u32,
    /// The recovery-journal sequence number this refcount delta is tied to,
    /// used to decide when the recovery journal block may be reclaimed.
    pub recovery_journal_sequence: u64,
}

impl SlabJournalEntry {
    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0] = self.operation as u8;
        let offset_bytes = self.slab_block_offset.to_le_bytes();
        out[1..4].copy_from_slice(&offset_bytes[0..3]);
        out[4..12].copy_from_slice(&self.recovery_journal_sequence.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; 12]) -> Result<Self> {
        let operation = SlabJournalOperation::from_u8(bytes[0])?;
        let mut offset_bytes = [0u8; 4];
        offset_bytes[0..3].copy_from_slice(&bytes[1..4]);
        let slab_block_offset = u32::from_le_bytes(offset_bytes);
        let recovery_journal_sequence = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        Ok(Self { operation, slab_block_offset, recovery_journal_sequence })
    }
}

/// One append-only tail block of the slab journal: a batch of entries
/// pending commit to disk.
#[derive(Debug, Default, Clone)]
pub struct SlabJournalBlock {
    pub entries: Vec<SlabJournalEntry>,
    pub committed: bool,
}

/// Ring buffer of slab journal tail blocks. Entries are appended to the
/// current (uncommitted) tail block; a commit is forced when the recovery
/// journal asks the slab to release its lock on a given sequence number
/// (spec §4.3).
pub struct SlabJournal {
    blocks: VecDeque<SlabJournalBlock>,
    entries_per_block: usize,
    /// Lowest recovery-journal sequence number any uncommitted entry still
    /// depends on; used to answer "can recovery journal block N reclaim?".
    oldest_uncommitted_sequence: Option<u64>,
}

impl SlabJournal {
    pub fn new(entries_per_block: usize) -> Self {
        let mut blocks = VecDeque::new();
        blocks.push_back(SlabJournalBlock::default());
        Self { blocks, entries_per_block, oldest_uncommitted_sequence: None }
    }

    pub fn append(&mut self, entry: SlabJournalEntry) {
        self.oldest_uncommitted_sequence = Some(
            self.oldest_uncommitted_sequence
                .map_or(entry.recovery_journal_sequence, |s| s.min(entry.recovery_journal_sequence)),
        );

        let tail = self.blocks.back_mut().expect("journal always has a tail block");
        tail.entries.push(entry);
        if tail.entries.len() >= self.entries_per_block {
            self.blocks.push_back(SlabJournalBlock::default());
        }
    }

    /// Commit all tail blocks whose entries reference only recovery-journal
    /// sequence numbers at or before `locking_sequence`. Returns the number
    /// of blocks newly committed. Invariant (spec §4.3): for any acknowledged
    /// data VIO, this must happen before the recovery-journal block holding
    /// its block-map delta is reclaimed.
    pub fn commit_through(&mut self, locking_sequence: u64) -> usize {
        let mut committed = 0;
        for block in self.blocks.iter_mut() {
            if block.committed {
                continue;
            }
            let max_seq = block.entries.iter().map(|e| e.recovery_journal_sequence).max();
            match max_seq {
                Some(seq) if seq <= locking_sequence => {
                    block.committed = true;
                    committed += 1;
                }
                None => {
                    // Empty (not-yet-filled) tail block: nothing to commit yet.
                    break;
                }
                Some(_) => break,
            }
        }
        self.recompute_oldest_uncommitted();
        self.reclaim_committed_blocks();
        committed
    }

    fn recompute_oldest_uncommitted(&mut self) {
        self.oldest_uncommitted_sequence = self
            .blocks
            .iter()
            .filter(|b| !b.committed)
            .flat_map(|b| b.entries.iter())
            .map(|e| e.recovery_journal_sequence)
            .min();
    }

    fn reclaim_committed_blocks(&mut self) {
        while self.blocks.len() > 1 && self.blocks.front().map(|b| b.committed).unwrap_or(false) {
            self.blocks.pop_front();
        }
    }

    pub fn oldest_uncommitted_sequence(&self) -> Option<u64> {
        self.oldest_uncommitted_sequence
    }

    pub fn pending_block_count(&self) -> usize {
        self.blocks.iter().filter(|b| !b.committed).count()
    }
}

/// Slab liveness/consistency status (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabStatus {
    Rebuilt,
    RequiresScrubbing,
    RequiresHighPriorityScrubbing,
    Rebuilding,
    Replaying,
}

/// Slab admin sub-machine (spec §4.3):
/// `NEW -> LOADING -> NORMAL -> SCRUBBING? -> NORMAL -> DRAINING -> QUIESCENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabAdminState {
    New,
    Loading,
    Normal,
    Scrubbing,
    Draining,
    Quiescent,
}

impl SlabAdminState {
    pub fn can_allocate(&self) -> bool {
        matches!(self, SlabAdminState::Normal)
    }

    fn transition(&mut self, next: SlabAdminState) -> Result<()> {
        use SlabAdminState::*;
        let allowed = matches!(
            (*self, next),
            (New, Loading)
                | (Loading, Normal)
                | (Normal, Scrubbing)
                | (Scrubbing, Normal)
                | (Normal, Draining)
                | (Scrubbing, Draining)
                | (Draining, Quiescent)
        );
        if !allowed {
            return Err(VdoError::InvalidAdminState {
                op: "slab_transition",
                state: "incompatible source/target admin state",
            });
        }
        *self = next;
        Ok(())
    }
}

pub struct Slab {
    pub slab_number: u32,
    pub start: Pbn,
    pub block_count: u64,
    pub journal: SlabJournal,
    pub reference_counts: ReferenceCounts,
    pub status: SlabStatus,
    pub admin_state: SlabAdminState,
}

impl Slab {
    pub fn new(slab_number: u32, start: Pbn, block_count: u64, journal_entries_per_block: usize) -> Self {
        Self {
            slab_number,
            start,
            block_count,
            journal: SlabJournal::new(journal_entries_per_block),
            reference_counts: ReferenceCounts::new(block_count as usize),
            status: SlabStatus::RequiresScrubbing,
            admin_state: SlabAdminState::New,
        }
    }

    pub fn offset_of(&self, pbn: Pbn) -> usize {
        refcounts::offset_within_slab(pbn, self.start, self.block_count)
    }

    pub fn free_block_count(&self) -> u64 {
        self.reference_counts.free_block_count()
    }

    pub fn load(&mut self) -> Result<()> {
        self.admin_state.transition(SlabAdminState::Loading)?;
        // A freshly formatted slab has nothing to replay; scrubbing is only
        // required when the slab summary says the tail wasn't flushed clean.
        self.admin_state.transition(SlabAdminState::Normal)?;
        self.status = SlabStatus::Rebuilt;
        Ok(())
    }

    pub fn begin_scrubbing(&mut self, high_priority: bool) -> Result<()> {
        self.admin_state.transition(SlabAdminState::Scrubbing)?;
        self.status = if high_priority {
            SlabStatus::RequiresHighPriorityScrubbing
        } else {
            SlabStatus::Rebuilding
        };
        Ok(())
    }

    /// Replay the on-disk slab journal into the in-memory reference counts.
    /// Until this completes the slab cannot satisfy allocations (spec §4.3).
    pub fn finish_scrubbing(&mut self) -> Result<()> {
        self.admin_state.transition(SlabAdminState::Normal)?;
        self.status = SlabStatus::Rebuilt;
        Ok(())
    }

    pub fn drain(&mut self) -> Result<()> {
        self.admin_state.transition(SlabAdminState::Draining)?;
        self.admin_state.transition(SlabAdminState::Quiescent)
    }

    /// Apply a refcount delta and append the corresponding slab journal
    /// entry in one step, preserving ordering between the two per slab
    /// (spec §5's "for a given slab, refcount deltas are applied on the
    /// owning physical zone thread in the order of their journal points").
    pub fn apply_increment(&mut self, pbn: Pbn, recovery_sequence: u64) -> Result<refcounts::RefCountDelta> {
        let offset = self.offset_of(pbn);
        let delta = self.reference_counts.increment(offset)?;
        self.journal.append(SlabJournalEntry {
            operation: SlabJournalOperation::Increment,
            slab_block_offset: offset as u32,
            recovery_journal_sequence: recovery_sequence,
        });
        Ok(delta)
    }

    /// Commit the provisional claim made by an earlier `allocate` into a
    /// real reference, once the VIO's block-map/journal writes for it are
    /// durable. Used both for a plain single-holder block and for the first
    /// fragment-holder of a freshly allocated shared compressed block.
    pub fn commit_provisional_allocation(&mut self, pbn: Pbn, recovery_sequence: u64) -> Result<()> {
        let offset = self.offset_of(pbn);
        self.reference_counts.commit_provisional(offset)?;
        self.journal.append(SlabJournalEntry {
            operation: SlabJournalOperation::Increment,
            slab_block_offset: offset as u32,
            recovery_journal_sequence: recovery_sequence,
        });
        Ok(())
    }

    /// Release a provisional claim that turned out to be unused, e.g. a
    /// write that allocated its own block but then got packed into a
    /// different shared compressed block instead. Never journaled: the
    /// claim was never durable, so it simply vanishes.
    pub fn cancel_provisional_allocation(&mut self, pbn: Pbn) -> Result<()> {
        let offset = self.offset_of(pbn);
        self.reference_counts.cancel_provisional(offset)
    }

    pub fn apply_decrement(&mut self, pbn: Pbn, recovery_sequence: u64) -> Result<refcounts::RefCountDelta> {
        let offset = self.offset_of(pbn);
        let delta = self.reference_counts.decrement(offset)?;
        self.journal.append(SlabJournalEntry {
            operation: SlabJournalOperation::Decrement,
            slab_block_offset: offset as u32,
            recovery_journal_sequence: recovery_sequence,
        });
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_journal_commits_only_through_locking_sequence() {
        let mut journal = SlabJournal::new(2);
        journal.append(SlabJournalEntry {
            operation: SlabJournalOperation::Increment,
            slab_block_offset: 0,
            recovery_journal_sequence: 1,
        });
        journal.append(SlabJournalEntry {
            operation: SlabJournalOperation::Increment,
            slab_block_offset: 1,
            recovery_journal_sequence: 3,
        });
        assert_eq!(journal.commit_through(1), 1);
        assert_eq!(journal.oldest_uncommitted_sequence(), None);
    }

    #[test]
    fn load_then_drain_transitions_succeed() {
        let mut slab = Slab::new(0, Pbn::new(0).unwrap(), 16, 8);
        slab.load().unwrap();
        assert!(slab.admin_state.can_allocate());
        slab.drain().unwrap();
        assert_eq!(slab.admin_state, SlabAdminState::Quiescent);
    }

    #[test]
    fn commit_then_cancel_provisional_allocation() {
        let mut slab = Slab::new(0, Pbn::new(0).unwrap(), 16, 8);
        slab.load().unwrap();
        let offset = slab.reference_counts.allocate_next_free().unwrap();
        let pbn = Pbn::new(offset as u64).unwrap();
        slab.commit_provisional_allocation(pbn, 1).unwrap();
        assert_eq!(slab.reference_counts.raw_count(offset).unwrap(), 1);
        assert_eq!(slab.journal.pending_block_count(), 1);

        let offset2 = slab.reference_counts.allocate_next_free().unwrap();
        let pbn2 = Pbn::new(offset2 as u64).unwrap();
        let free_before = slab.free_block_count();
        slab.cancel_provisional_allocation(pbn2).unwrap();
        assert_eq!(slab.free_block_count(), free_before + 1);
    }

    #[test]
    fn scrubbing_blocks_allocation_until_finished() {
        let mut slab = Slab::new(0, Pbn::new(0).unwrap(), 16, 8);
        slab.load().unwrap();
        slab.begin_scrubbing(false).unwrap();
        assert!(!slab.admin_state.can_allocate());
        slab.finish_scrubbing().unwrap();
        assert!(slab.admin_state.can_allocate());
    }
}
