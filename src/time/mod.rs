//! Clock source: monotonic time reads and deadline arithmetic.
//!
//! Deadlines are [`Timespec`] values read from a [`Clock`]. The production
//! clock is [`MonotonicClock`] (`CLOCK_MONOTONIC`, immune to wall-clock
//! adjustments); [`ManualClock`] is a settable clock for deterministic tests.
//!
//! # Example
//!
//! ```ignore
//! use appframe::time::{Clock, MonotonicClock};
//! use std::time::Duration;
//!
//! let clock = MonotonicClock;
//! let deadline = clock.now() + Duration::from_millis(250);
//! ```

use std::cell::Cell;
use std::ops::Add;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point on a clock, in seconds and nanoseconds.
///
/// `nsec` is always kept in `0..1_000_000_000`, so the derived ordering is the
/// chronological one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    /// Builds a normalized timespec, carrying excess nanoseconds into seconds.
    pub fn new(sec: i64, nsec: i64) -> Self {
        let sec = sec + nsec.div_euclid(NANOS_PER_SEC);
        let nsec = nsec.rem_euclid(NANOS_PER_SEC);
        Self { sec, nsec }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self::new(duration.as_secs() as i64, duration.subsec_nanos() as i64)
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: Timespec) -> Duration {
        if *self <= earlier {
            return Duration::ZERO;
        }

        let mut sec = self.sec - earlier.sec;
        let mut nsec = self.nsec - earlier.nsec;
        if nsec < 0 {
            sec -= 1;
            nsec += NANOS_PER_SEC;
        }

        Duration::new(sec as u64, nsec as u32)
    }

    /// Signed difference `self - earlier` in whole milliseconds.
    pub fn millis_since(&self, earlier: Timespec) -> i64 {
        (self.sec - earlier.sec) * 1000 + (self.nsec - earlier.nsec) / 1_000_000
    }
}

impl Add<Duration> for Timespec {
    type Output = Timespec;

    fn add(self, rhs: Duration) -> Timespec {
        let sec = self.sec.saturating_add(rhs.as_secs().min(i64::MAX as u64) as i64);
        let mut nsec = self.nsec + rhs.subsec_nanos() as i64;

        if nsec >= NANOS_PER_SEC {
            nsec -= NANOS_PER_SEC;
            return Timespec {
                sec: sec.saturating_add(1),
                nsec,
            };
        }

        Timespec { sec, nsec }
    }
}

/// Source of the current time for timers and bounded waits.
pub trait Clock {
    fn now(&self) -> Timespec;
}

/// `CLOCK_MONOTONIC`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Timespec {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }

        Timespec::new(ts.tv_sec as i64, ts.tv_nsec as i64)
    }
}

impl MonotonicClock {
    /// Maps a monotonic instant onto the wall clock.
    ///
    /// Useful for printing when a timer will fire or when an event happened.
    pub fn to_system_time(&self, then: Timespec) -> SystemTime {
        let now = self.now();
        let wall = SystemTime::now();

        if then <= now {
            wall.checked_sub(now.saturating_since(then)).unwrap_or(SystemTime::UNIX_EPOCH)
        } else {
            wall + then.saturating_since(now)
        }
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and hand
/// another to a [`Daemon`](crate::Daemon).
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Timespec>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now: Timespec) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timespec {
        self.now.get()
    }
}
