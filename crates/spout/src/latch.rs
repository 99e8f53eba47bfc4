//! One-shot readiness gate.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A one-shot, thread-safe gate: once released it stays released.
///
/// Used to park a thread in [`Poller::unregister`](crate::Poller::unregister)
/// until the poller thread has finished tearing a client down, and as the
/// completion signal behind [`DeliveryHandle`](crate::DeliveryHandle).
///
/// The released flag is checked and waited on under the same lock, so a
/// `release()` racing a `wait()` can never be lost.
#[derive(Debug, Default)]
pub struct ReadinessLatch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl ReadinessLatch {
    /// Creates a latch in the unreleased state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases the latch and wakes every waiter. Idempotent.
    pub fn release(&self) {
        let mut released = self.lock();
        if !*released {
            *released = true;
            self.cond.notify_all();
        }
    }

    /// Blocks until the latch is released. Returns immediately if it already is.
    pub fn wait(&self) {
        let mut released = self.lock();
        while !*released {
            released = self
                .cond
                .wait(released)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the latch is released or `timeout` elapses.
    ///
    /// Returns `true` if the latch was released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self.lock();
        while !*released {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            released = self
                .cond
                .wait_timeout(released, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Non-blocking query.
    #[inline]
    pub fn is_released(&self) -> bool {
        *self.lock()
    }

    // A poisoned flag is still a valid bool.
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_release_is_idempotent() {
        let latch = ReadinessLatch::new();
        assert!(!latch.is_released());

        latch.release();
        latch.release();
        assert!(latch.is_released());

        // Already released: must not block
        latch.wait();
        assert!(latch.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let latch = ReadinessLatch::new();
        let start = Instant::now();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_release_wakes_all_waiters() {
        let latch = Arc::new(ReadinessLatch::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        latch.release();

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
