//! Producer lifecycle states.

use crate::error::ProducerError;
use crate::invariants::debug_assert_status_transition;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a producer is in its lifecycle.
///
/// ```text
/// Initial ─► Configured ─► Connected ─► Closing ─► Closed
///                              │  ▲
///                              ▼  │
///                  Disconnecting ─► Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Created, not set up. Only `setup` is allowed.
    Initial = 0,
    /// Set up; the transport is created on first use.
    Configured = 1,
    /// Transport created and registered with the poller.
    Connected = 2,
    /// Idle disconnect in flight.
    Disconnecting = 3,
    /// Transport released; the next dispatch reconnects.
    Disconnected = 4,
    /// Final flush in flight; only the closing thread may still use the transport.
    Closing = 5,
    /// Terminal.
    Closed = 6,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Initial,
        Status::Configured,
        Status::Connected,
        Status::Disconnecting,
        Status::Disconnected,
        Status::Closing,
        Status::Closed,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Configured => "configured",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub fn is_initial(self) -> bool {
        self == Self::Initial
    }

    pub fn is_configured(self) -> bool {
        self == Self::Configured
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn is_disconnecting(self) -> bool {
        self == Self::Disconnecting
    }

    pub fn is_disconnected(self) -> bool {
        self == Self::Disconnected
    }

    pub fn is_closing(self) -> bool {
        self == Self::Closing
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// Set up and not torn down: configured, connected or disconnected.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Configured | Self::Connected | Self::Disconnected)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Initial, Configured)
                | (Initial, Closed)
                | (Configured, Connected)
                | (Configured, Closing)
                | (Configured, Closed)
                | (Connected, Disconnecting)
                | (Connected, Closing)
                | (Disconnecting, Disconnected)
                | (Disconnected, Connected)
                | (Disconnected, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder of a [`Status`].
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Status::Initial as u8))
    }

    /// Current status. Fails on a value outside the lifecycle.
    pub(crate) fn get(&self) -> Result<Status, ProducerError> {
        let raw = self.0.load(Ordering::Acquire);
        Status::from_u8(raw).ok_or(ProducerError::StatusInvalid(raw))
    }

    /// Moves to `next`. Callers serialize transitions under the operating lock.
    pub(crate) fn set(&self, next: Status) {
        let previous = self.0.swap(next as u8, Ordering::AcqRel);
        if let Some(previous) = Status::from_u8(previous) {
            debug_assert_status_transition!(previous, next);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_raw(&self, raw: u8) {
        self.0.store(raw, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicates(status: Status) -> [bool; 7] {
        [
            status.is_initial(),
            status.is_configured(),
            status.is_connected(),
            status.is_disconnecting(),
            status.is_disconnected(),
            status.is_closing(),
            status.is_closed(),
        ]
    }

    #[test]
    fn test_exactly_one_predicate_holds() {
        for status in Status::ALL {
            assert_eq!(predicates(status).iter().filter(|p| **p).count(), 1, "{status}");
        }
    }

    #[test]
    fn test_active_set() {
        let active: Vec<_> = Status::ALL.into_iter().filter(|s| s.is_active()).collect();
        assert_eq!(active, vec![Status::Configured, Status::Connected, Status::Disconnected]);
    }

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Status::Initial,
            Status::Configured,
            Status::Connected,
            Status::Disconnecting,
            Status::Disconnected,
            Status::Connected,
            Status::Closing,
            Status::Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Status::Closed.can_transition_to(Status::Connected));
        assert!(!Status::Closing.can_transition_to(Status::Connected));
    }

    #[test]
    fn test_unknown_raw_value() {
        let cell = StatusCell::new();
        assert_eq!(cell.get().unwrap(), Status::Initial);

        cell.set(Status::Configured);
        assert_eq!(cell.get().unwrap(), Status::Configured);

        cell.set_raw(42);
        assert!(matches!(cell.get(), Err(ProducerError::StatusInvalid(42))));
    }
}
