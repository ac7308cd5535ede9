//! prodq: a single-file, memory-mapped, multi-process product queue.
//!
//! A fixed-capacity circular store of opaque data products, shared across
//! cooperating processes through file-backed memory and advisory
//! byte-range locks. Producers append products keyed by a 16-byte content
//! signature; consumers sequence through them in insertion-time order;
//! when the queue is full the oldest unlocked product is evicted to make
//! room. The queue survives process crashes without corruption: every
//! index mutation happens under a control-region file lock the kernel
//! releases when its holder dies.
//!
//! # Usage
//!
//! ```ignore
//! let mut pq = ProductQueue::create("ldm.pq", 0o664, OpenFlags::empty(),
//!                                   0, 1 << 30, 100_000)?;
//! pq.insert(&info, payload)?;
//! pq.sequence(Relation::Greater, &ClassFilter::All, |info, data| {
//!     deliver(info, data);
//!     Disposition::Consumed
//! })?;
//! ```
//!
//! The on-disk format is native-endian and is not portable across hosts
//! of different endianness.

#[cfg(not(unix))]
compile_error!("this crate requires a Unix platform (fcntl record locks, POSIX signals)");

mod error;
mod fb;
mod header;
mod lock;
mod mapping;
mod product;
mod queue;
mod region;
mod signal;
mod stats;
mod sx;
mod time;
mod tq;

/// File identity word ("PQUE").
pub const PQ_MAGIC: u32 = 0x5051_5545;
/// On-disk format revision.
pub const PQ_VERSION: u32 = 7;

/// Default data-region alignment when `create` is given 0.
pub const DEFAULT_ALIGN: u64 = 8;

// Index-section identity words.
pub(crate) const RL_MAGIC: u32 = 0x524c_4841;
pub(crate) const FB_MAGIC: u32 = 0x5451_4642;
pub(crate) const SX_MAGIC: u32 = 0x5358_4841;

/// "No index" sentinel used by every on-disk linked structure.
pub(crate) const NIL: u64 = u64::MAX;

/// How a search key relates to the entry being sought: the greatest entry
/// strictly less, the exact entry, or the least entry strictly greater.
/// `Greater` walks a sequence forward in time, `Less` backward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    Less,
    Equal,
    Greater,
}

pub use error::{PqError, Result};
pub use product::{ClassFilter, ProductInfo, Signature, encode_product};
pub use queue::{Disposition, OpenFlags, ProductQueue, Reservation};
pub use signal::{suspend, suspend_with};
pub use stats::{MvrtMetrics, QueueStats};
pub use time::Timestamp;
