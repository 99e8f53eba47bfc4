//! The opaque broker client seam.
//!
//! A producer never talks to a broker itself. It drives a [`Transport`]:
//! produce, poll, flush, close and the transaction commands. The transport
//! reports delivery results, statistics and asynchronous errors through the
//! [`EventSink`] it was built with, and only while it is being polled.
//!
//! # Threading contract
//!
//! A transport is shared between the producer (produce, flush, transaction
//! commands on caller threads) and the poller thread (poll). Implementations
//! must be internally synchronized, which the `Send + Sync` bound makes
//! explicit. Event sink callbacks must be invoked without holding internal
//! locks: listeners may re-enter the transport (a callback that closes its own
//! producer polls it once more before teardown).

mod delivery;
mod error;
mod memory;
mod noop;

pub use delivery::{DeliveryHandle, DeliveryReport, Message};
pub use error::{ErrorCode, TransportError};
pub use memory::{MemoryStats, MemoryTransport, MemoryTransportBuilder, MemoryTransportConfig, Operation};
pub use noop::{NoopTransport, NoopTransportBuilder};

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Key/value settings handed to transports and per-call topic overrides.
pub type Settings = BTreeMap<String, String>;

/// Something a transport reports while being polled.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Final outcome of one produced message.
    Delivery {
        /// Destination topic.
        topic: String,
        /// Caller-attached label, if any.
        label: Option<String>,
        /// Where the message landed, or why it did not.
        result: Result<DeliveryReport, TransportError>,
    },
    /// Periodic client statistics.
    Statistics(serde_json::Value),
    /// An error not tied to a single message.
    Error(TransportError),
}

/// Receives transport events. Called on whichever thread polls the transport.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Everything a builder gets to create one transport.
#[derive(Clone)]
pub struct BuildContext {
    /// Id of the owning producer.
    pub producer_id: String,
    /// Producer settings.
    pub settings: Settings,
    /// Where to report events.
    pub events: EventSink,
}

/// Creates transports. Called on connect and again on every reload.
pub trait TransportBuilder: Send + Sync {
    /// Builds a fresh, unconnected-to-poller transport.
    fn build(&self, ctx: BuildContext) -> Result<Arc<dyn Transport>, TransportError>;
}

impl<F> TransportBuilder for F
where
    F: Fn(BuildContext) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync,
{
    fn build(&self, ctx: BuildContext) -> Result<Arc<dyn Transport>, TransportError> {
        self(ctx)
    }
}

/// A broker protocol client.
pub trait Transport: Send + Sync {
    /// Enqueues a message. The handle resolves once the delivery report is polled.
    fn produce(&self, message: &Message, topic_settings: &Settings) -> Result<DeliveryHandle, TransportError>;

    /// Serves queued events until the queue is empty or `max_time` elapses.
    ///
    /// Returns `true` when it stopped because of the time limit with events
    /// still pending.
    fn poll_drain_nonblocking(&self, max_time: Duration) -> Result<bool, TransportError>;

    /// Number of events (and in-flight messages) still pending.
    fn queue_size(&self) -> usize;

    /// Asks the transport to write one byte to `fd` whenever it enqueues an event.
    fn enable_queue_io_events(&self, fd: RawFd);

    /// Stops all writes to the descriptor given to `enable_queue_io_events`.
    ///
    /// Once this returns, no write is in flight.
    fn disable_queue_io_events(&self);

    /// Blocks until every in-flight message is delivered or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Drops every message not yet delivered; their handles resolve with a purge error.
    fn purge(&self) -> Result<(), TransportError>;

    /// Releases the client. Further calls fail with a state error.
    fn close(&self);

    /// Registers the transactional identity with the coordinator.
    fn init_transactions(&self, timeout: Duration) -> Result<(), TransportError>;

    fn begin_transaction(&self) -> Result<(), TransportError>;

    fn commit_transaction(&self, timeout: Duration) -> Result<(), TransportError>;

    fn abort_transaction(&self, timeout: Duration) -> Result<(), TransportError>;
}
