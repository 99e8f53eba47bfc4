//! Transport used when delivery is disabled.

use super::{
    BuildContext, DeliveryHandle, DeliveryReport, Message, Settings, Transport, TransportBuilder,
    TransportError,
};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A transport that discards everything.
///
/// `produce` returns an already resolved handle; every other call is a no-op.
/// Useful for tests and for running without a broker.
#[derive(Debug, Default)]
pub struct NoopTransport {
    offset: AtomicI64,
}

impl NoopTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for NoopTransport {
    fn produce(&self, message: &Message, _topic_settings: &Settings) -> Result<DeliveryHandle, TransportError> {
        Ok(DeliveryHandle::resolved(DeliveryReport {
            topic: message.topic.clone(),
            partition: message.partition.unwrap_or(0),
            offset: self.offset.fetch_add(1, Ordering::Relaxed),
            label: message.label.clone(),
        }))
    }

    fn poll_drain_nonblocking(&self, _max_time: Duration) -> Result<bool, TransportError> {
        Ok(false)
    }

    fn queue_size(&self) -> usize {
        0
    }

    fn enable_queue_io_events(&self, _fd: RawFd) {}

    fn disable_queue_io_events(&self) {}

    fn flush(&self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    fn purge(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) {}

    fn init_transactions(&self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    fn begin_transaction(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn commit_transaction(&self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    fn abort_transaction(&self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Builds [`NoopTransport`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransportBuilder;

impl TransportBuilder for NoopTransportBuilder {
    fn build(&self, _ctx: BuildContext) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(NoopTransport::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_resolves_immediately() {
        let transport = NoopTransport::new();
        let msg = Message::new("events", b"a".to_vec()).with_label("first");

        let first = transport.produce(&msg, &Settings::new()).unwrap();
        let second = transport.produce(&msg, &Settings::new()).unwrap();

        assert!(!first.is_pending());
        let report = first.wait(Duration::ZERO).unwrap();
        assert_eq!(report.offset, 0);
        assert_eq!(report.label.as_deref(), Some("first"));
        assert_eq!(second.wait(Duration::ZERO).unwrap().offset, 1);

        assert!(!transport.poll_drain_nonblocking(Duration::ZERO).unwrap());
        assert_eq!(transport.queue_size(), 0);
    }
}
