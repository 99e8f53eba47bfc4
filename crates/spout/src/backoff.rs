use std::hint;
use std::thread;
use std::time::Duration;

/// Adaptive wait used while spin-polling a transport until its queue drains.
///
/// Progressively escalates: spin with PAUSE → yield to OS → sleep for the
/// configured park interval. Callers [`reset`](Self::reset) it whenever the
/// queue they wait on shrank.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    park: Duration,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6; // 2^6 = 64 spins max before yielding
    const YIELD_LIMIT: u32 = 10; // Then start parking

    /// Creates a backoff that parks for `park` once spinning and yielding are exhausted.
    #[inline]
    pub fn new(park: Duration) -> Self {
        Self { step: 0, park }
    }

    /// Waits a little longer than last time.
    #[inline]
    pub fn wait(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(self.park);
            return;
        }
        self.step += 1;
    }

    /// Returns `true` once the backoff has escalated to parking.
    #[inline]
    pub fn is_parking(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }

    /// Reset after progress was observed.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

/// Linearly increasing delay between retried commands: `base * attempt`.
///
/// Attempts are 1-indexed; attempt 0 means "no delay".
#[inline]
pub fn linear_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_escalates_to_parking() {
        let mut b = Backoff::new(Duration::from_micros(10));
        assert!(!b.is_parking());

        while !b.is_parking() {
            b.wait();
        }
        assert_eq!(b.step, Backoff::YIELD_LIMIT + 1);

        // Parking does not advance further
        b.wait();
        assert_eq!(b.step, Backoff::YIELD_LIMIT + 1);

        b.reset();
        assert_eq!(b.step, 0);
    }

    #[test]
    fn test_linear_delay() {
        let base = Duration::from_millis(15);
        assert_eq!(linear_delay(base, 0), Duration::ZERO);
        assert_eq!(linear_delay(base, 1), Duration::from_millis(15));
        assert_eq!(linear_delay(base, 4), Duration::from_millis(60));
    }
}
