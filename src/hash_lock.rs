//! Hash lock: coordinates at-most-one dedupe/allocation decision per
//! content fingerprint (spec §4.7).
//!
//! Grounded in the teacher's `transaction/lock_manager.rs` request/waiter
//! shape (a table of live locks keyed by resource, FIFO waiters per lock)
//! narrowed to this crate's single always-exclusive lock mode: the VIO that
//! inserts the fingerprint becomes the "agent" and runs the verify/allocate
//! decision; everyone else waits for it.

use std::collections::{HashMap, VecDeque};

use crate::error::{Result, VdoError};
use crate::types::{BlockMapEntry, Fingerprint};

/// Outcome of trying to join a fingerprint's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// This VIO inserted the fingerprint and is now responsible for driving
    /// the dedupe decision (query advisor, verify or allocate, post advice).
    Agent,
    /// Another VIO is already the agent for this fingerprint; this VIO has
    /// been queued as a waiter and will be released once the agent commits.
    Waiter,
}

enum LockOutcome {
    /// Every waiter should link against this mapping and bump its refcount.
    /// Carries the full `BlockMapEntry` (not just a bare `Pbn`) so a waiter
    /// can link against a `Compressed(k)` slot when the agent's write ended
    /// up packed instead of landing on its own uncompressed block.
    Committed(BlockMapEntry),
}

struct HashLockState {
    agent_data_vio_id: u32,
    waiters: VecDeque<u32>,
    outcome: Option<LockOutcome>,
}

/// Process-wide table of active hash locks, owned by the hash-lock zone
/// thread (spec §5).
#[derive(Default)]
pub struct HashLockTable {
    locks: HashMap<Fingerprint, HashLockState>,
}

impl HashLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A write's hashing stage calls this after computing its fingerprint.
    /// Invariant (spec §4.7): no two VIOs with the same fingerprint ever
    /// allocate independently — only the agent ever queries the advisor or
    /// allocates.
    pub fn join(&mut self, fingerprint: Fingerprint, data_vio_id: u32) -> JoinOutcome {
        match self.locks.get_mut(&fingerprint) {
            None => {
                self.locks.insert(
                    fingerprint,
                    HashLockState { agent_data_vio_id: data_vio_id, waiters: VecDeque::new(), outcome: None },
                );
                JoinOutcome::Agent
            }
            Some(state) => {
                state.waiters.push_back(data_vio_id);
                JoinOutcome::Waiter
            }
        }
    }

    /// The agent commits to a final mapping (verified-duplicate, freshly
    /// allocated uncompressed block, or a packer-assigned compressed slot).
    /// All current and future-draining waiters link against this mapping.
    /// Callers must not commit until the mapping is truly final: committing
    /// an agent's pre-compression provisional PBN here, only to have it
    /// cancelled once the write is handed to the packer, would let a waiter
    /// link against a freed block.
    pub fn commit(&mut self, fingerprint: Fingerprint, agent_data_vio_id: u32, mapping: BlockMapEntry) -> Result<()> {
        let state = self
            .locks
            .get_mut(&fingerprint)
            .ok_or_else(|| VdoError::assertion("commit on absent hash lock"))?;
        if state.agent_data_vio_id != agent_data_vio_id {
            return Err(VdoError::assertion("commit called by non-agent VIO"));
        }
        state.outcome = Some(LockOutcome::Committed(mapping));
        Ok(())
    }

    /// Drain one waiter, returning its VIO id and the committed mapping it
    /// should link against and bump the refcount of. `None` once all
    /// waiters have been released.
    pub fn drain_waiter(&mut self, fingerprint: Fingerprint) -> Result<Option<(u32, BlockMapEntry)>> {
        let state = self
            .locks
            .get_mut(&fingerprint)
            .ok_or_else(|| VdoError::assertion("drain on absent hash lock"))?;
        let Some(LockOutcome::Committed(mapping)) = state.outcome else {
            return Err(VdoError::assertion("drain before agent committed"));
        };
        Ok(state.waiters.pop_front().map(|id| (id, mapping)))
    }

    /// Non-destructive peek at the agent's committed mapping, for a waiter
    /// thread blocked on a condition variable rather than being woken in
    /// FIFO order by the agent itself.
    pub fn committed_mapping(&self, fingerprint: Fingerprint) -> Option<BlockMapEntry> {
        match self.locks.get(&fingerprint)?.outcome {
            Some(LockOutcome::Committed(mapping)) => Some(mapping),
            None => None,
        }
    }

    /// Remove a specific waiter once it has linked against the committed
    /// mapping and bumped its refcount, for use alongside `committed_mapping`
    /// by a polling waiter rather than `drain_waiter`'s FIFO consumption.
    pub fn finish_waiting(&mut self, fingerprint: Fingerprint, data_vio_id: u32) -> Result<()> {
        let state = self
            .locks
            .get_mut(&fingerprint)
            .ok_or_else(|| VdoError::assertion("finish_waiting on absent hash lock"))?;
        let before = state.waiters.len();
        state.waiters.retain(|&id| id != data_vio_id);
        if state.waiters.len() == before {
            return Err(VdoError::assertion("finish_waiting: vio was not a waiter"));
        }
        Ok(())
    }

    /// Destroy the lock once the agent and every waiter have been released
    /// (spec §3: "a hash lock is ... destroyed when its last waiter is
    /// released").
    pub fn release(&mut self, fingerprint: Fingerprint) -> Result<()> {
        let state = self
            .locks
            .get(&fingerprint)
            .ok_or_else(|| VdoError::assertion("release on absent hash lock"))?;
        if !state.waiters.is_empty() {
            return Err(VdoError::assertion("release while waiters remain"));
        }
        self.locks.remove(&fingerprint);
        Ok(())
    }

    pub fn waiter_count(&self, fingerprint: Fingerprint) -> usize {
        self.locks.get(&fingerprint).map(|s| s.waiters.len()).unwrap_or(0)
    }

    pub fn is_active(&self, fingerprint: Fingerprint) -> bool {
        self.locks.contains_key(&fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MappingState, Pbn};

    #[test]
    fn first_joiner_is_agent_rest_are_waiters() {
        let mut table = HashLockTable::new();
        let fp = Fingerprint(1);
        assert_eq!(table.join(fp, 10), JoinOutcome::Agent);
        assert_eq!(table.join(fp, 11), JoinOutcome::Waiter);
        assert_eq!(table.join(fp, 12), JoinOutcome::Waiter);
        assert_eq!(table.waiter_count(fp), 2);
    }

    #[test]
    fn waiters_drain_in_fifo_order_against_committed_mapping() {
        let mut table = HashLockTable::new();
        let fp = Fingerprint(2);
        table.join(fp, 10);
        table.join(fp, 11);
        table.join(fp, 12);
        let mapping = BlockMapEntry { pbn: Pbn::new(99).unwrap(), state: MappingState::Uncompressed };
        table.commit(fp, 10, mapping).unwrap();

        let (id, got) = table.drain_waiter(fp).unwrap().unwrap();
        assert_eq!((id, got), (11, mapping));
        let (id, got) = table.drain_waiter(fp).unwrap().unwrap();
        assert_eq!((id, got), (12, mapping));
        assert!(table.drain_waiter(fp).unwrap().is_none());
        table.release(fp).unwrap();
        assert!(!table.is_active(fp));
    }

    #[test]
    fn non_agent_cannot_commit() {
        let mut table = HashLockTable::new();
        let fp = Fingerprint(3);
        table.join(fp, 10);
        let mapping = BlockMapEntry { pbn: Pbn::new(1).unwrap(), state: MappingState::Uncompressed };
        assert!(table.commit(fp, 11, mapping).is_err());
    }

    #[test]
    fn release_with_pending_waiters_is_rejected() {
        let mut table = HashLockTable::new();
        let fp = Fingerprint(4);
        table.join(fp, 10);
        table.join(fp, 11);
        assert!(table.release(fp).is_err());
    }
}
