//! Error kinds surfaced by the queue.
//!
//! Every public operation returns [`Result`]. Allocation failures and lock
//! contention leave the queue consistent and are safe to retry; `Corrupt`
//! means an integrity check failed and the operation aborted without
//! modifying on-disk state.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PqError>;

#[derive(Debug, Error)]
pub enum PqError {
    /// A product with this signature is already in the queue.
    #[error("signature already present")]
    Duplicate,

    /// Requested size exceeds the data segment.
    #[error("product too big: {size} bytes, data segment holds {limit}")]
    TooBig { size: u64, limit: u64 },

    /// No room and nothing left to evict.
    #[error("out of memory: queue cannot make room")]
    OutOfMemory,

    /// No free region large enough; eviction may make room.
    #[error("no free region large enough")]
    NoRoom,

    /// The free-block arena has no cell of any usable size.
    #[error("skip-list arena exhausted")]
    OutOfSlots,

    /// Every eviction candidate is locked by another process.
    #[error("all eviction candidates are locked by other processes")]
    AllLocked,

    /// Signature, cursor target, or offset not present.
    #[error("not found")]
    NotFound,

    /// Another process holds a conflicting lock on the target.
    #[error("locked by another process")]
    Locked,

    /// Sequencing reached the end of the queue in the requested direction.
    #[error("end of queue")]
    QueueEnd,

    /// An integrity check failed. The operation did not modify the queue.
    #[error("queue corrupt: {0}")]
    Corrupt(String),

    /// The on-disk writer counter is saturated.
    #[error("writer count at maximum; no further writable opens")]
    WriterLimit,

    /// A caller-supplied argument is unusable.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Underlying OS I/O or locking error.
    #[error("system error: {0}")]
    System(#[from] io::Error),
}

/// Log and build a `Corrupt` error in one step.
macro_rules! corrupt {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("queue corrupt: {msg}");
        $crate::error::PqError::Corrupt(msg)
    }};
}

pub(crate) use corrupt;
