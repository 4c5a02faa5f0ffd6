//! Minimal time primitives used throughout the session database.
//!
//! The core never calls a wall clock itself. Every operation that needs to know "now" takes
//! it as an explicit argument, the same way a 5-tuple or a mask iterator is passed in: the
//! clock is an external collaborator. This keeps the locked sections free of syscalls and
//! makes the whole crate trivially testable by constructing synthetic instants.

use core::ops::{Add, Sub};

/// A monotonic point in time, in milliseconds since some unspecified epoch.
///
/// Only ever compared against other `Instant`s obtained from the same caller-chosen epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

impl Instant {
    /// Construct an instant from a millisecond count.
    pub const fn from_millis(millis: u64) -> Self {
        Instant(millis)
    }

    /// The millisecond count since the epoch this instant was constructed against.
    pub const fn millis(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        self.0.checked_add(duration.0).map(Instant)
    }

    /// Saturating variant of [`Instant::checked_add`], used where an overflowing TTL should
    /// simply mean "never expires" rather than a panic.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Instant(self.0.saturating_add(duration.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        self.saturating_add(rhs)
    }
}

impl Sub for Instant {
    type Output = Duration;

    /// Saturates to zero if `rhs` is later than `self`, since callers only ever use this to
    /// measure elapsed time which cannot be negative.
    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

/// A span of time, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(u64);

impl Duration {
    pub const fn from_millis(millis: u64) -> Self {
        Duration(millis)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1000))
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

/// When a timer is next due to fire.
///
/// Separate from `Option<Instant>` so call sites read as intent ("never" vs "at") rather than
/// an incidental absence of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expiration {
    /// The timer is not armed and will not fire on its own.
    Never,
    /// The timer is due at the given instant.
    At(Instant),
}

impl Expiration {
    pub fn is_due(self, now: Instant) -> bool {
        match self {
            Expiration::Never => false,
            Expiration::At(at) => now >= at,
        }
    }
}

impl Default for Expiration {
    fn default() -> Self {
        Expiration::Never
    }
}
