//! Bounded backoff for CAS retry loops.
//!
//! Backing off never changes what a retry loop computes, it only spaces out the retries so a
//! thread that keeps losing the race stops hammering the contended cache line.

use std::thread;
use util;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

pub struct Backoff {
    step: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

impl Backoff {
    #[inline]
    pub fn new() -> Self {
        Backoff { step: 0 }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Back off after a lost race. Spins `1 << step` times while `step` is small, then yields
    /// the time slice to the scheduler.
    #[inline]
    pub fn spin(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1 << self.step {
                util::pause();
            }
        } else {
            thread::yield_now();
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// True once spinning has given way to yielding.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.step > SPIN_LIMIT
    }
}

mod test {

    #[test]
    fn test_base() {
        use backoff::Backoff;

        let mut backoff = Backoff::new();
        assert!(!backoff.is_completed());
        for _ in 0..7 {
            backoff.spin();
        }
        assert!(backoff.is_completed());
        for _ in 0..100 {
            backoff.spin();
        }
        assert!(backoff.is_completed());
        backoff.reset();
        assert!(!backoff.is_completed());
    }
}
