//! Time sources.
//!
//! The scheduler reads time only through [`Clock`]. Hosts supply
//! [`SystemClock`]; tests and simulations drive a [`ManualClock`].

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of the current time for all due decisions.
pub trait Clock: Send + Sync {
    /// The current time. Successive calls never go backwards.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time, clamped so it never moves backwards within a process.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = match *last {
            Some(prev) if prev > wall => prev,
            _ => wall,
        };
        *last = Some(now);
        now
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the Unix epoch.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Move the clock to `to`. Earlier instants are ignored.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if to > *now {
            *now = to;
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if by > Duration::zero() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at_epoch();
        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now().timestamp(), 5);
    }

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::at_epoch();
        clock.advance(Duration::seconds(10));
        clock.set(DateTime::<Utc>::UNIX_EPOCH);
        clock.advance(Duration::seconds(-3));
        assert_eq!(clock.now().timestamp(), 10);
    }
}
