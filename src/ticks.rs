//! Monotonic tick counter used as the LRU timestamp source. There is no
//! timer interrupt here, so `tick()` stands in for the driver and must be
//! invoked by whatever embeds this crate (or, in tests, by the test
//! itself) to advance time. `current()` takes no lock but the counter's
//! own.
use crate::spinlock::SpinLock;

static TICKS: SpinLock<u64> = SpinLock::new(0, "ticks");

/// Advance the tick counter by one and return the new value.
pub fn tick() -> u64 {
    let mut t = TICKS.lock();
    *t = t.wrapping_add(1);
    *t
}

/// Read the current tick value.
pub fn current() -> u64 {
    *TICKS.lock()
}
