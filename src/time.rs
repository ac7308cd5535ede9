//! Microsecond-resolution timestamps as stored in the file.
//!
//! The time index requires strictly unique keys, so the insertion path
//! advances a colliding timestamp by [`Timestamp::TICK`] (one microsecond)
//! until it is unique. Sentinel values bracket all real times for cursor
//! initialization.

use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};

/// Seconds and microseconds since the Unix epoch, native layout.
///
/// `usec` is kept normalized to `0..1_000_000` for real times; the ordering
/// derives lexicographically from `(sec, usec)`, which is correct for
/// normalized values and places the sentinels at the extremes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Pod, Zeroable)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: i64,
}

impl Timestamp {
    /// Smallest representable increment (one microsecond).
    pub const TICK: i64 = 1;

    /// "No timestamp" sentinel; orders before everything.
    pub const NONE: Timestamp = Timestamp {
        sec: i64::MIN,
        usec: 0,
    };

    /// Orders before every real timestamp but after [`Timestamp::NONE`].
    pub const BEGINNING_OF_TIME: Timestamp = Timestamp {
        sec: i64::MIN,
        usec: 1,
    };

    /// Orders after every real timestamp.
    pub const END_OF_TIME: Timestamp = Timestamp {
        sec: i64::MAX,
        usec: 999_999,
    };

    /// Current wall-clock time.
    pub fn now() -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                sec: d.as_secs() as i64,
                usec: i64::from(d.subsec_micros()),
            },
            // Clock before the epoch; clamp rather than panic.
            Err(e) => {
                let d = e.duration();
                Timestamp {
                    sec: -(d.as_secs() as i64),
                    usec: 0,
                }
            }
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        *self == Timestamp::NONE
    }

    /// Advance by `n` microseconds, carrying into seconds.
    pub fn plus_usec(self, n: i64) -> Timestamp {
        let total = self.usec + n;
        Timestamp {
            sec: self.sec + total.div_euclid(1_000_000),
            usec: total.rem_euclid(1_000_000),
        }
    }

    /// Step back by `n` microseconds.
    pub fn minus_usec(self, n: i64) -> Timestamp {
        self.plus_usec(-n)
    }

    /// `self - earlier` as a duration-valued timestamp. Negative differences
    /// clamp to zero.
    pub fn diff(self, earlier: Timestamp) -> Timestamp {
        let usec_total =
            (self.sec - earlier.sec) * 1_000_000 + (self.usec - earlier.usec);
        if usec_total <= 0 {
            return Timestamp { sec: 0, usec: 0 };
        }
        Timestamp {
            sec: usec_total / 1_000_000,
            usec: usec_total % 1_000_000,
        }
    }

    /// Whole seconds, rounding the microsecond part down.
    #[inline]
    pub fn as_secs(&self) -> i64 {
        self.sec
    }
}
