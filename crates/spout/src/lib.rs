//! # spout
//!
//! A message producer for a distributed log, built around one shared
//! background thread that polls every producer's transport.
//!
//! ## Architecture
//!
//! ```text
//!  caller threads                         poller thread
//!  ──────────────                         ─────────────
//!  Producer::produce_* ──► Transport ──► byte ──► SignalPipe ─┐
//!  Producer::close ─► signal_close ──────────────► SignalPipe ─┤
//!                    wait on latch ◄── teardown ◄── poll(2) ◄──┘
//!                                        │
//!                                        └─► poll_drain_nonblocking
//!                                             └─► Monitor events
//! ```
//!
//! - [`Poller`]: multiplexes registered transports with `poll(2)` over one
//!   self-pipe per client, time-boxes every drain and forces a periodic poll
//!   of idle clients so statistics and token callbacks keep firing.
//! - [`Producer`]: lifecycle state machine, sync/async/batched dispatch,
//!   local buffering, transactions with retry/abort handling, and transport
//!   reloads after fatal errors.
//! - [`Transport`]: the broker client seam. [`MemoryTransport`] is an
//!   in-process implementation; [`NoopTransport`] discards everything.
//! - [`Monitor`]: named events (`producer.connected`, `error.occurred`, ...)
//!   for observability.
//!
//! ## Example
//!
//! ```no_run
//! use spout::{Message, MemoryTransportBuilder, Producer, ProducerConfig};
//!
//! let producer = Producer::with_config(ProducerConfig::new(MemoryTransportBuilder::default()))?;
//! let report = producer.produce_sync(Message::new("events", b"hello".to_vec()))?;
//! println!("delivered to {}@{}", report.partition, report.offset);
//! producer.close()?;
//! # Ok::<(), spout::ProducerError>(())
//! ```

mod backoff;
mod config;
mod error;
mod invariants;
mod latch;

pub mod instrumentation;
pub mod polling;
pub mod producer;
pub mod transport;

pub use backoff::{linear_delay, Backoff};
pub use config::{PollerConfig, PollingConfig, ProducerConfig, ENABLE_IDEMPOTENCE, TRANSACTIONAL_ID};
pub use error::{ConfigError, InstrumentationError, PollerError, ProducerError};
pub use instrumentation::{events, Event, LoggerListener, Monitor};
pub use latch::ReadinessLatch;
pub use polling::{Poller, SignalPipe};
pub use producer::{DispatchOptions, Producer, Status, Variant};
pub use transport::{
    DeliveryHandle, DeliveryReport, ErrorCode, MemoryTransport, MemoryTransportBuilder, MemoryTransportConfig,
    Message, NoopTransport, NoopTransportBuilder, Operation, Transport, TransportBuilder, TransportError,
    TransportEvent,
};
