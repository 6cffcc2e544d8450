//! Local time source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the local logical time, in 100 ns units.
pub trait Clock: Send + Sync {
    /// Current local time.
    fn now(&self) -> u64;
}

/// Wall clock time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (elapsed.as_nanos() / 100) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now`.
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Sets the time.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves the time forward by `delta`.
    pub fn advance(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shifts a peer timestamp into local time.
pub fn apply_offset(timestamp: u64, offset: i64) -> u64 {
    if offset >= 0 {
        timestamp.saturating_sub(offset as u64)
    } else {
        timestamp.saturating_add(offset.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now(), 15);
        clock.set(3);
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn system_clock_is_past_epoch() {
        assert!(SystemClock.now() > 0);
    }

    #[test]
    fn offsets() {
        assert_eq!(apply_offset(100, 30), 70);
        assert_eq!(apply_offset(100, -30), 130);
        assert_eq!(apply_offset(10, 30), 0);
        assert_eq!(apply_offset(u64::MAX, -1), u64::MAX);
    }
}
