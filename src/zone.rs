//! Zone model (spec §5): a small fixed number of single-threaded, cooperative
//! execution domains communicating by message passing.
//!
//! Per the Design Notes (§9), the original's `getCallbackThreadID()` global is
//! replaced here with a thread-local holding the current thread's zone
//! identity, set once when the zone thread is spawned.

use std::cell::Cell;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};

/// Which kind of zone a thread belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneKind {
    Journal,
    Logical(u32),
    Physical(u32),
    HashLock,
    BioAck,
}

impl ZoneKind {
    pub fn label(&self) -> String {
        match self {
            ZoneKind::Journal => "journal".to_string(),
            ZoneKind::Logical(n) => format!("logical-{n}"),
            ZoneKind::Physical(n) => format!("physical-{n}"),
            ZoneKind::HashLock => "hash-lock".to_string(),
            ZoneKind::BioAck => "bio-ack".to_string(),
        }
    }
}

thread_local! {
    static CURRENT_ZONE: Cell<Option<ZoneKind>> = const { Cell::new(None) };
}

/// Record that the calling thread is now running as the given zone. Called
/// exactly once, from the top of the zone's thread body.
pub fn set_current_zone(zone: ZoneKind) {
    CURRENT_ZONE.with(|cell| cell.set(Some(zone)));
}

/// The zone the calling thread is running as, if any.
pub fn current_zone() -> Option<ZoneKind> {
    CURRENT_ZONE.with(|cell| cell.get())
}

/// Assert the calling thread is on the expected zone. Mirrors the original's
/// `ASSERT_LOG_ONLY(getCallbackThreadID() == ...)` checks; violating zone
/// affinity is a programming error, not a runtime condition to recover from,
/// so this panics in debug builds and is compiled out in release (spec §9's
/// "zone affinity" testable property, enforced in test/debug builds).
pub fn assert_on_zone(expected: ZoneKind) {
    debug_assert_eq!(
        current_zone(),
        Some(expected),
        "operation restricted to zone {:?} ran on {:?}",
        expected,
        current_zone()
    );
}

/// A zone's inbox: a bounded FIFO channel carrying tagged messages (the
/// Design Notes' "dynamic dispatch / completions" replacement — a tagged
/// event variant rather than a function-pointer completion).
pub struct ZoneInbox<M> {
    pub sender: Sender<M>,
    pub receiver: Receiver<M>,
}

impl<M> ZoneInbox<M> {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam::channel::bounded(capacity);
        Self { sender, receiver }
    }
}

/// Spawn a zone's dedicated OS thread. `body` must set the zone identity via
/// [`set_current_zone`] as its first action then run a blocking FIFO receive
/// loop; work within a zone is strictly non-preemptive (spec §5).
pub fn spawn_zone<F>(zone: ZoneKind, body: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(zone.label())
        .spawn(move || {
            set_current_zone(zone);
            tracing::debug!(zone = %zone.label(), "zone thread started");
            body();
        })
        .expect("failed to spawn zone thread")
}
