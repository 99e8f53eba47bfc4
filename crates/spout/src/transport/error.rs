//! Classified transport errors.

use std::fmt;
use thiserror::Error;

/// Stable error code reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Local produce queue is full.
    QueueFull,
    /// Another producer with the same transactional identity took over.
    Fenced,
    /// Message was purged from the local queue before delivery.
    PurgeQueue,
    /// Message delivery timed out.
    MessageTimedOut,
    /// Operation is not valid in the transport's current state.
    State,
    /// Transaction coordinator rejected the current transaction state.
    InvalidTransactionState,
    /// A blocking transport call did not complete in time.
    TimedOut,
    /// Broker connection level failure.
    Transport,
    /// Unrecoverable client failure.
    Fatal,
    /// Any other numeric code.
    Other(i32),
}

impl ErrorCode {
    /// Stable name of the code, used in instrumentation payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Fenced => "fenced",
            Self::PurgeQueue => "purge_queue",
            Self::MessageTimedOut => "msg_timed_out",
            Self::State => "state",
            Self::InvalidTransactionState => "invalid_transaction_state",
            Self::TimedOut => "timed_out",
            Self::Transport => "transport",
            Self::Fatal => "fatal",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "other({code})"),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// An error raised by a transport, carrying its own recovery classification.
///
/// The producer never inspects error types to decide what to do; it asks the
/// error whether it is fatal, retryable or abortable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    code: ErrorCode,
    message: String,
    fatal: bool,
    retryable: bool,
    abortable: bool,
}

impl TransportError {
    /// A plain, unclassified error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
            retryable: false,
            abortable: false,
        }
    }

    /// An unrecoverable error.
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message).with_fatal(true)
    }

    /// An error that may succeed if the same call is retried.
    pub fn retryable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message).with_retryable(true)
    }

    /// An error that requires aborting the current transaction.
    pub fn abortable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message).with_abortable(true)
    }

    /// The local queue is full; retryable.
    pub fn queue_full() -> Self {
        Self::retryable(ErrorCode::QueueFull, "local queue full")
    }

    /// The message was purged before delivery.
    pub fn purged() -> Self {
        Self::new(ErrorCode::PurgeQueue, "purged from local queue")
    }

    /// Sets the fatal flag.
    pub fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    /// Sets the retryable flag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Sets the abortable flag.
    pub fn with_abortable(mut self, abortable: bool) -> Self {
        self.abortable = abortable;
        self
    }

    #[inline]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    #[inline]
    pub fn is_abortable(&self) -> bool {
        self.abortable
    }

    /// Returns `true` for delivery failures caused by a purge or an aborted transaction.
    #[inline]
    pub fn is_purge(&self) -> bool {
        self.code == ErrorCode::PurgeQueue
    }

    #[inline]
    pub fn is_queue_full(&self) -> bool {
        self.code == ErrorCode::QueueFull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_flags() {
        let e = TransportError::fatal(ErrorCode::Fenced, "fenced by newer instance");
        assert!(e.is_fatal());
        assert!(!e.is_retryable());
        assert!(!e.is_abortable());
        assert_eq!(e.code(), ErrorCode::Fenced);
        assert_eq!(e.to_string(), "fenced: fenced by newer instance");

        let e = TransportError::retryable(ErrorCode::TimedOut, "coordinator busy").with_abortable(true);
        assert!(e.is_retryable() && e.is_abortable() && !e.is_fatal());
    }

    #[test]
    fn test_well_known_errors() {
        assert!(TransportError::queue_full().is_queue_full());
        assert!(TransportError::queue_full().is_retryable());
        assert!(TransportError::purged().is_purge());
        assert_eq!(ErrorCode::Other(42).to_string(), "other(42)");
    }
}
