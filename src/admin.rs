//! Device-wide admin state machine (spec §6).
//!
//! Grounded in the teacher's `transaction/lock_manager.rs`/recovery-style
//! explicit state enum with guarded transitions (no ad hoc bool soup), and
//! in spec §4.3's per-slab admin sub-machine, generalized here to the whole
//! device.

use crate::error::{Result, VdoError};

/// Load strategy requested via the admin surface's `load` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    Normal,
    Recovery,
    Rebuild,
}

/// Drain strategy requested via the admin surface's `drain` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStrategy {
    Flush,
    Rebuild,
    Suspend,
    Save,
}

/// Device-wide admin state (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    NormalOperation,
    Flushing,
    Suspending,
    Saving,
    Resuming,
    Scrubbing,
    Saved,
    ReadOnly,
}

impl AdminState {
    fn transition_allowed(&self, next: AdminState) -> bool {
        use AdminState::*;
        if next == ReadOnly {
            // A fatal error can drive any state read-only immediately.
            return true;
        }
        matches!(
            (*self, next),
            (NormalOperation, Flushing)
                | (NormalOperation, Suspending)
                | (NormalOperation, Saving)
                | (NormalOperation, Scrubbing)
                | (Scrubbing, NormalOperation)
                | (Flushing, NormalOperation)
                | (Suspending, Saved)
                | (Saving, Saved)
                | (Saved, Resuming)
                | (Resuming, NormalOperation)
        )
    }
}

/// Device admin surface (spec §6): `load`, `prepare_to_allocate`, `drain`,
/// `resume`, `prepare_to_grow`, `use_new_slabs`, `abandon_new_slabs`.
pub struct AdminStateMachine {
    state: AdminState,
    /// Set by `prepare_to_grow`; consumed by `use_new_slabs` or
    /// `abandon_new_slabs`.
    pending_grow: Option<u64>,
}

impl AdminStateMachine {
    pub fn new() -> Self {
        Self { state: AdminState::Saved, pending_grow: None }
    }

    pub fn state(&self) -> AdminState {
        self.state
    }

    fn transition(&mut self, next: AdminState, op: &'static str) -> Result<()> {
        if !self.state.transition_allowed(next) {
            return Err(VdoError::InvalidAdminState { op, state: self.state_name() });
        }
        self.state = next;
        Ok(())
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            AdminState::NormalOperation => "NORMAL_OPERATION",
            AdminState::Flushing => "FLUSHING",
            AdminState::Suspending => "SUSPENDING",
            AdminState::Saving => "SAVING",
            AdminState::Resuming => "RESUMING",
            AdminState::Scrubbing => "SCRUBBING",
            AdminState::Saved => "SAVED",
            AdminState::ReadOnly => "READ_ONLY",
        }
    }

    pub fn load(&mut self, _strategy: LoadStrategy) -> Result<()> {
        self.transition(AdminState::Resuming, "load")?;
        self.transition(AdminState::NormalOperation, "load")
    }

    pub fn prepare_to_allocate(&mut self) -> Result<()> {
        if self.state != AdminState::NormalOperation {
            return Err(VdoError::InvalidAdminState { op: "prepare_to_allocate", state: self.state_name() });
        }
        Ok(())
    }

    pub fn drain(&mut self, strategy: DrainStrategy) -> Result<()> {
        let target = match strategy {
            DrainStrategy::Flush => AdminState::Flushing,
            DrainStrategy::Rebuild => AdminState::Saving,
            DrainStrategy::Suspend => AdminState::Suspending,
            DrainStrategy::Save => AdminState::Saving,
        };
        self.transition(target, "drain")?;
        match strategy {
            DrainStrategy::Flush => self.transition(AdminState::NormalOperation, "drain"),
            _ => self.transition(AdminState::Saved, "drain"),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        self.transition(AdminState::Resuming, "resume")?;
        self.transition(AdminState::NormalOperation, "resume")
    }

    pub fn prepare_to_grow(&mut self, new_physical_blocks: u64) -> Result<()> {
        if self.state != AdminState::NormalOperation {
            return Err(VdoError::InvalidAdminState { op: "prepare_to_grow", state: self.state_name() });
        }
        self.pending_grow = Some(new_physical_blocks);
        Ok(())
    }

    pub fn use_new_slabs(&mut self) -> Result<u64> {
        self.pending_grow
            .take()
            .ok_or_else(|| VdoError::InvalidAdminState { op: "use_new_slabs", state: "no pending grow" })
    }

    pub fn abandon_new_slabs(&mut self) {
        self.pending_grow = None;
    }

    /// Drive the device read-only immediately, from any state (spec §7: a
    /// fatal error "drives read-only"; every zone thereafter rejects new
    /// work that could mutate persistent state).
    pub fn enter_read_only(&mut self) {
        self.state = AdminState::ReadOnly;
    }

    pub fn is_read_only(&self) -> bool {
        self.state == AdminState::ReadOnly
    }

    pub fn accepts_writes(&self) -> bool {
        matches!(self.state, AdminState::NormalOperation)
    }
}

impl Default for AdminStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_then_drain_flush_round_trips() {
        let mut admin = AdminStateMachine::new();
        admin.load(LoadStrategy::Normal).unwrap();
        assert_eq!(admin.state(), AdminState::NormalOperation);
        admin.drain(DrainStrategy::Flush).unwrap();
        assert_eq!(admin.state(), AdminState::NormalOperation);
    }

    #[test]
    fn prepare_to_allocate_requires_normal_operation() {
        let admin = AdminStateMachine::new();
        let mut admin = admin;
        assert!(admin.prepare_to_allocate().is_err());
        admin.load(LoadStrategy::Normal).unwrap();
        assert!(admin.prepare_to_allocate().is_ok());
    }

    #[test]
    fn read_only_is_reachable_from_any_state() {
        let mut admin = AdminStateMachine::new();
        admin.enter_read_only();
        assert!(admin.is_read_only());
        assert!(!admin.accepts_writes());
    }

    #[test]
    fn grow_cycle_requires_prepare_before_use() {
        let mut admin = AdminStateMachine::new();
        admin.load(LoadStrategy::Normal).unwrap();
        assert!(admin.use_new_slabs().is_err());
        admin.prepare_to_grow(1024).unwrap();
        assert_eq!(admin.use_new_slabs().unwrap(), 1024);
    }
}
