use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock timestamps for the queue.
///
/// Block ages, message creation times and the future-timestamp guard on
/// append all read from the queue's clock.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Returns the current timestamp in nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;
}

fn wall_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// A clock that uses `std::time::SystemTime`.
///
/// Susceptible to NTP adjustments, but requires no calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        wall_ns()
    }
}

/// A clock that uses the CPU's Time-Stamp Counter (TSC) via the `quanta` crate.
///
/// Anchored to `SystemTime` at construction, then advanced by TSC ticks so it
/// never jumps backwards.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        Self {
            clock,
            start_wall_ns: wall_ns(),
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}

/// A clock that only moves when told to. Used to drive age limits and
/// timestamp validation deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ns
            .fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(Duration::from_micros(2));
        assert_eq!(clock.now(), 3_000);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn test_quanta_clock_is_monotonic() {
        let clock = QuantaClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 0);
    }
}
