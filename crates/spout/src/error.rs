//! Error types for poller, producer and configuration operations.

use crate::transport::{ErrorCode, TransportError};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the shared poller.
#[derive(Debug, Error)]
pub enum PollerError {
    /// Creating a pipe, polling descriptors or spawning the thread failed.
    #[error("poller i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The poller was shut down and accepts no new registrations.
    #[error("poller has been shut down")]
    ShutDown,

    /// A client with this id is already registered.
    #[error("producer {0} is already registered with the poller")]
    AlreadyRegistered(String),

    /// A transport failed while being polled.
    #[error("transport failed while polling: {0}")]
    Transport(#[from] TransportError),
}

/// Setup-time configuration errors. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value that must be positive was zero.
    #[error("{field} must be greater than zero")]
    MustBePositive {
        /// Name of the offending setting.
        field: &'static str,
    },
}

/// Errors raised by monitor subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentationError {
    /// The event name is not one the producer ever emits.
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

/// Errors that can cross a public producer operation.
#[derive(Debug, Error)]
pub enum ProducerError {
    /// The producer has not been set up yet.
    #[error("producer is not configured")]
    NotConfigured,

    /// `setup` was called on an already configured producer.
    #[error("producer is already configured")]
    AlreadyConfigured,

    /// The producer is closing or closed.
    #[error("producer is closed")]
    Closed,

    /// The status cell holds a value outside the lifecycle.
    #[error("producer reached an unrecognized status ({0})")]
    StatusInvalid(u8),

    /// The transport was created by another process (the producer was inherited across a fork).
    #[error("producer connected in process {connected_pid} used from process {current_pid}")]
    UsedInParentProcess {
        /// Process that created the transport.
        connected_pid: u32,
        /// Process attempting to use it.
        current_pid: u32,
    },

    /// `close` was called from inside the caller's own transaction.
    #[error("producer cannot be closed from within its own transaction")]
    ClosingInTransaction,

    /// `transaction` was called on a producer without a transactional id.
    #[error("producer is not transactional")]
    NotTransactional,

    /// Voluntary rollback signal: returning it from a transaction block aborts
    /// the transaction without surfacing an error.
    #[error("transaction aborted on request")]
    AbortTransaction,

    /// The message failed local validation.
    #[error("invalid message: {0}")]
    MessageInvalid(String),

    /// A delivery report did not arrive in time.
    #[error("delivery to {topic} not confirmed within {timeout:?}")]
    DeliveryTimeout {
        /// Destination topic.
        topic: String,
        /// How long the caller waited.
        timeout: Duration,
    },

    /// A classified transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Registering with the poller failed.
    #[error(transparent)]
    Poller(#[from] PollerError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An error raised by caller code inside a transaction block.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ProducerError {
    /// Wraps an arbitrary caller error.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Returns the transport error, if this is one.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the transport error code, if this is a transport error.
    pub fn code(&self) -> Option<ErrorCode> {
        self.transport().map(TransportError::code)
    }

    /// Returns `true` for errors caused by calling an operation in the wrong lifecycle stage.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::NotConfigured
                | Self::AlreadyConfigured
                | Self::Closed
                | Self::UsedInParentProcess { .. }
                | Self::ClosingInTransaction
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_passthrough() {
        let e: ProducerError = TransportError::fatal(ErrorCode::Fenced, "fenced").into();
        assert_eq!(e.code(), Some(ErrorCode::Fenced));
        assert_eq!(e.to_string(), "fenced: fenced");
        assert!(!e.is_lifecycle());
    }

    #[test]
    fn test_lifecycle_classification() {
        assert!(ProducerError::Closed.is_lifecycle());
        assert!(ProducerError::NotConfigured.is_lifecycle());
        assert!(!ProducerError::AbortTransaction.is_lifecycle());
        assert!(ProducerError::other("boom").code().is_none());
    }
}
