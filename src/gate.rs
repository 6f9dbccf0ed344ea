//! A small blocking wait/notify primitive used wherever spec §5 calls for a
//! "wait-queue push" suspension point (allocator `OUT_OF_SPACE`, recovery
//! journal admission, data-VIO pool exhaustion). Built on `parking_lot`'s
//! `Mutex`/`Condvar`, matching the teacher's use of `parking_lot` throughout
//! `transaction/lock_manager.rs` for exactly this kind of wait queue.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct Gate {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `notify_all` is called at least once after this call
    /// began, then return so the caller can re-check its condition. Mirrors
    /// the FIFO-release wait queues in spec §4.4/§4.5: the caller is
    /// responsible for the actual FIFO ordering (via the component's own
    /// `push_waiter`/`pop_waiter`), this just parks the thread.
    pub fn wait(&self) {
        let mut guard = self.lock.lock();
        self.cvar.wait(&mut guard);
    }

    /// Like [`Gate::wait`] but gives up after `timeout` even without a
    /// notification, for callers that need to re-check a deadline (the
    /// packer's bounded flush timer) rather than wait indefinitely.
    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.cvar.wait_for(&mut guard, timeout);
    }

    pub fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cvar.notify_all();
    }
}
