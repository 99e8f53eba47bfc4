//! Debug assertion macros for poller and producer invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so there is
//! zero overhead in release builds.

// =============================================================================
// Poller-owned teardown
// =============================================================================

/// Assert that a client's pipe is closed and its latch released only by the
/// poller thread (or inline by a caller that already is the poller thread).
///
/// Used in: `PollerInner::handle_close()`
macro_rules! debug_assert_on_poller_thread {
    ($on_poller_thread:expr, $producer_id:expr) => {
        debug_assert!(
            $on_poller_thread,
            "client teardown for {} ran outside the poller thread",
            $producer_id
        )
    };
}

/// Assert that a torn-down client is no longer in the registry.
///
/// Used in: `PollerInner::handle_close()` after removal
macro_rules! debug_assert_unregistered {
    ($still_registered:expr, $producer_id:expr) => {
        debug_assert!(
            !$still_registered,
            "client {} still registered after teardown",
            $producer_id
        )
    };
}

// =============================================================================
// Producer status machine
// =============================================================================

/// Assert that a status change follows the lifecycle graph.
///
/// Used in: `StatusCell::set()`
macro_rules! debug_assert_status_transition {
    ($from:expr, $to:expr) => {
        debug_assert!(
            $from.can_transition_to($to),
            "invalid producer status transition: {:?} -> {:?}",
            $from,
            $to
        )
    };
}

// =============================================================================
// Bounded retries
// =============================================================================

/// Assert that a retry loop never runs past its configured cap.
///
/// Used in: transactional command retries, idempotent reloads
macro_rules! debug_assert_attempt_bounded {
    ($attempt:expr, $max:expr) => {
        debug_assert!(
            $attempt <= $max,
            "attempt {} exceeds configured maximum {}",
            $attempt,
            $max
        )
    };
}

pub(crate) use debug_assert_attempt_bounded;
pub(crate) use debug_assert_on_poller_thread;
pub(crate) use debug_assert_status_transition;
pub(crate) use debug_assert_unregistered;
