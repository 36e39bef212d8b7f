//! Small shared utilities: capture timestamps and saturating counters.

pub mod clamped;

use std::fmt;
use std::ops::Sub;

use serde::Serialize;

pub use clamped::Clamped;

const NS_IN_SEC: i64 = 1_000_000_000;

/// A capture timestamp with nanosecond resolution.
///
/// Mirrors the `{sec, nsec}` pair delivered by the capture source. Packet
/// timestamps are compared and differenced frequently, so this is a plain
/// `Copy` value type rather than a `std::time` wrapper.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub fn new(sec: i64, nsec: i64) -> Self {
        TimeSpec { sec, nsec }
    }

    /// Builds a timestamp from a nanosecond count.
    pub fn from_nanos(ns: i64) -> Self {
        TimeSpec {
            sec: ns / NS_IN_SEC,
            nsec: ns % NS_IN_SEC,
        }
    }

    /// Total nanoseconds represented by this timestamp.
    #[inline]
    pub fn as_nanos(&self) -> i64 {
        self.sec * NS_IN_SEC + self.nsec
    }

    /// Nanoseconds elapsed since `earlier`. Negative if `earlier` is in the
    /// future; out-of-order capture streams are reported by the caller.
    #[inline]
    pub fn nanos_since(&self, earlier: &TimeSpec) -> i64 {
        self.as_nanos() - earlier.as_nanos()
    }

    /// Whole seconds elapsed since `earlier`.
    #[inline]
    pub fn secs_since(&self, earlier: &TimeSpec) -> i64 {
        self.nanos_since(earlier) / NS_IN_SEC
    }
}

impl Sub for TimeSpec {
    type Output = TimeSpec;

    fn sub(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::from_nanos(self.as_nanos() - rhs.as_nanos())
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_timespec_nanos_roundtrip() {
        let ts = TimeSpec::new(12, 345_678_901);
        assert_eq!(TimeSpec::from_nanos(ts.as_nanos()), ts);
    }

    #[test]
    fn core_timespec_deltas() {
        let a = TimeSpec::new(10, 900_000_000);
        let b = TimeSpec::new(12, 100_000_000);
        assert_eq!(b.nanos_since(&a), 1_200_000_000);
        assert_eq!(b.secs_since(&a), 1);
        assert_eq!(b - a, TimeSpec::new(1, 200_000_000));
    }
}
