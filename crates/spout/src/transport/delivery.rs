use crate::error::ProducerError;
use crate::latch::ReadinessLatch;
use crate::transport::TransportError;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A message to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    /// Explicit partition; the transport picks one when `None`.
    pub partition: Option<i32>,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Caller-side tag echoed back in the delivery report. Never sent.
    pub label: Option<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: Some(payload.into()),
            ..Self::default()
        }
    }

    /// A message without payload.
    pub fn tombstone(topic: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Bytes counted against the payload size limit.
    pub fn size(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}

/// Where a message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub label: Option<String>,
}

struct DeliveryCell {
    topic: String,
    label: Option<String>,
    result: OnceLock<Result<DeliveryReport, TransportError>>,
    done: ReadinessLatch,
}

/// Pending outcome of one produced message.
///
/// Cloning shares the same outcome. Resolved exactly once, by the transport,
/// normally on the poller thread.
#[derive(Clone)]
pub struct DeliveryHandle {
    cell: Arc<DeliveryCell>,
}

impl DeliveryHandle {
    /// Creates an unresolved handle.
    pub fn new(topic: impl Into<String>, label: Option<String>) -> Self {
        Self {
            cell: Arc::new(DeliveryCell {
                topic: topic.into(),
                label,
                result: OnceLock::new(),
                done: ReadinessLatch::new(),
            }),
        }
    }

    /// Creates a handle that is already resolved successfully.
    pub fn resolved(report: DeliveryReport) -> Self {
        let handle = Self::new(report.topic.clone(), report.label.clone());
        handle.resolve(Ok(report));
        handle
    }

    /// Sets the outcome. Returns `false` if it was already set.
    pub fn resolve(&self, result: Result<DeliveryReport, TransportError>) -> bool {
        let first = self.cell.result.set(result).is_ok();
        if first {
            self.cell.done.release();
        }
        first
    }

    pub fn topic(&self) -> &str {
        &self.cell.topic
    }

    pub fn label(&self) -> Option<&str> {
        self.cell.label.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        !self.cell.done.is_released()
    }

    /// The outcome, if already known.
    pub fn try_result(&self) -> Option<Result<DeliveryReport, TransportError>> {
        self.cell.result.get().cloned()
    }

    /// Blocks until the outcome is known or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<DeliveryReport, ProducerError> {
        if !self.cell.done.wait_timeout(timeout) {
            return Err(ProducerError::DeliveryTimeout {
                topic: self.cell.topic.clone(),
                timeout,
            });
        }
        match self.cell.result.get() {
            Some(result) => result.clone().map_err(ProducerError::from),
            None => Err(ProducerError::DeliveryTimeout {
                topic: self.cell.topic.clone(),
                timeout,
            }),
        }
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("topic", &self.cell.topic)
            .field("label", &self.cell.label)
            .field("result", &self.cell.result.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn report(offset: i64) -> DeliveryReport {
        DeliveryReport {
            topic: "events".into(),
            partition: 0,
            offset,
            label: None,
        }
    }

    #[test]
    fn test_resolves_once() {
        let handle = DeliveryHandle::new("events", None);
        assert!(handle.is_pending());
        assert!(handle.try_result().is_none());

        assert!(handle.resolve(Ok(report(7))));
        assert!(!handle.resolve(Err(TransportError::purged())));

        assert!(!handle.is_pending());
        assert_eq!(handle.wait(Duration::ZERO).unwrap().offset, 7);
    }

    #[test]
    fn test_wait_times_out() {
        let handle = DeliveryHandle::new("events", Some("order-1".into()));
        let err = handle.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ProducerError::DeliveryTimeout { ref topic, .. } if topic == "events"));
        assert_eq!(handle.label(), Some("order-1"));
    }

    #[test]
    fn test_resolved_from_other_thread() {
        let handle = DeliveryHandle::new("events", None);
        let remote = handle.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.resolve(Err(TransportError::purged()));
        });

        let err = handle.wait(Duration::from_secs(2)).unwrap_err();
        assert!(err.transport().is_some_and(TransportError::is_purge));
        t.join().unwrap();
    }
}
