use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::Clock;

/// Bits reserved for the instance value in every generated id.
pub const INSTANCE_BITS: u32 = 10;
pub const MAX_INSTANCE: u16 = (1 << INSTANCE_BITS) - 1;

/// Monotonic 64-bit id source.
///
/// Ids are `counter << INSTANCE_BITS | instance`. The counter is seeded from
/// the wall clock in microseconds, so a restarted process starts above every
/// id it handed out before (unless it sustained more than one id per
/// microsecond), and two instances never collide.
#[derive(Debug)]
pub struct IdGenerator {
    instance: u64,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(instance: u16, clock: &dyn Clock) -> Self {
        let seed = clock.now() / 1_000;
        Self::with_seed(instance, seed)
    }

    pub fn with_seed(instance: u16, seed: u64) -> Self {
        Self {
            instance: u64::from(instance & MAX_INSTANCE),
            counter: AtomicU64::new(seed),
        }
    }

    pub fn next(&self) -> u64 {
        let counter = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        (counter << INSTANCE_BITS) | self.instance
    }

    /// Lifts the generator so every later id is above `id`.
    pub fn observe(&self, id: u64) {
        let counter = id >> INSTANCE_BITS;
        self.counter.fetch_max(counter, Ordering::AcqRel);
    }

    pub fn instance(&self) -> u16 {
        self.instance as u16
    }
}
