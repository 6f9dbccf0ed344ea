//! Error taxonomy for the vdo-core engine (spec §7).
//!
//! Errors are kinds, not exceptions: most of them are expected outcomes on
//! some path (`OutOfSpace` just means "wait"), and only a handful drive the
//! device into read-only mode. See [`VdoError::is_fatal`].

use thiserror::Error;

use crate::types::{Lbn, Pbn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VdoError {
    /// No free physical block in the requested zone. Recoverable by waiting.
    #[error("out of space in physical zone {zone}")]
    OutOfSpace { zone: u32 },

    /// A PBN or LBN outside the addressable range for this device.
    #[error("out of range: {what} {value}")]
    OutOfRange { what: &'static str, value: u64 },

    /// A compressed block's fragment header could not be parsed.
    #[error("invalid compressed fragment in block {pbn:?}")]
    InvalidFragment { pbn: Pbn },

    /// The device has been driven into read-only mode; the write failed.
    #[error("device is read-only")]
    ReadOnly,

    /// An admin operation was requested in a state that does not permit it.
    #[error("admin operation {op} invalid in state {state}")]
    InvalidAdminState { op: &'static str, state: &'static str },

    /// An internal invariant failed. Fatal on the write path.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    /// The LBN has no current write in flight to serialize against.
    #[error("no logical lock held for lbn {0:?}")]
    NoLogicalLock(Lbn),

    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, VdoError>;

impl From<std::io::Error> for VdoError {
    fn from(e: std::io::Error) -> Self {
        VdoError::Io(e.to_string())
    }
}

impl VdoError {
    /// Whether this error must drive the whole device read-only (spec §7's
    /// "Fatal" bucket: refcount/journal underflow, invalid slab index,
    /// invalid fragment header on the *write* path, assertion failures).
    pub fn is_fatal(&self) -> bool {
        matches!(self, VdoError::AssertionFailed(_))
    }

    pub fn assertion(msg: impl Into<String>) -> Self {
        VdoError::AssertionFailed(msg.into())
    }
}
