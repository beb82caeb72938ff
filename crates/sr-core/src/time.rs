//! Process-local monotonic time
//!
//! All engine timing (packet arrival, playheads, dispatch deadlines) is
//! expressed as seconds on one process-wide monotonic clock. Wrapping the
//! value instead of passing `Instant` around keeps the timeshift arithmetic
//! testable: tests construct times from raw seconds and never sleep.

use std::ops::{Add, Sub};
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds since the process epoch on the monotonic clock
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct MonoTime(f64);

impl MonoTime {
    /// Current monotonic time
    pub fn now() -> Self {
        let epoch = EPOCH.get_or_init(Instant::now);
        Self(epoch.elapsed().as_secs_f64())
    }

    /// Construct from raw seconds
    #[inline]
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Seconds since the process epoch
    #[inline]
    pub fn secs(self) -> f64 {
        self.0
    }
}

impl Add<f64> for MonoTime {
    type Output = MonoTime;

    #[inline]
    fn add(self, rhs: f64) -> MonoTime {
        MonoTime(self.0 + rhs)
    }
}

impl Sub<f64> for MonoTime {
    type Output = MonoTime;

    #[inline]
    fn sub(self, rhs: f64) -> MonoTime {
        MonoTime(self.0 - rhs)
    }
}

impl Sub for MonoTime {
    type Output = f64;

    /// Signed difference in seconds
    #[inline]
    fn sub(self, rhs: MonoTime) -> f64 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = MonoTime::now();
        let b = MonoTime::now();
        assert!(b >= a);
    }

    #[test]
    fn test_arithmetic() {
        let t = MonoTime::from_secs(10.0);
        assert_eq!((t + 0.5).secs(), 10.5);
        assert_eq!((t - 2.0).secs(), 8.0);
        assert_eq!(t - MonoTime::from_secs(4.0), 6.0);
    }
}
