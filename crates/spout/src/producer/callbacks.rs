//! Translation of transport events into instrumentation events.

use super::{Producer, ProducerInner};
use crate::instrumentation::events;
use crate::transport::{EventSink, TransportEvent};
use serde_json::json;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Sink handed to every transport the producer builds.
///
/// Holds the producer weakly: a transport kept alive elsewhere must not keep
/// its producer alive.
pub(super) fn event_sink(producer: Weak<ProducerInner>) -> EventSink {
    Arc::new(move |event| {
        if let Some(inner) = producer.upgrade() {
            Producer { inner }.on_transport_event(event);
        }
    })
}

impl Producer {
    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Delivery {
                topic,
                label,
                result: Ok(report),
            } => self.instrument(
                events::MESSAGE_ACKNOWLEDGED,
                json!({
                    "topic": topic,
                    "partition": report.partition,
                    "offset": report.offset,
                    "label": label,
                }),
            ),
            TransportEvent::Delivery {
                topic,
                label,
                result: Err(error),
            } if error.is_purge() => self.instrument(
                events::MESSAGE_PURGED,
                json!({
                    "topic": topic,
                    "label": label,
                    "error": error.to_string(),
                }),
            ),
            TransportEvent::Delivery {
                topic,
                label,
                result: Err(error),
            } => self.instrument(
                events::ERROR_OCCURRED,
                json!({
                    "type": "transport.dispatch_error",
                    "topic": topic,
                    "label": label,
                    "error": error.to_string(),
                    "code": error.code().as_str(),
                }),
            ),
            TransportEvent::Statistics(statistics) => {
                self.instrument(events::STATISTICS_EMITTED, json!({ "statistics": statistics }));
                self.disconnect_if_idle();
            }
            TransportEvent::Error(error) => self.instrument(
                events::ERROR_OCCURRED,
                json!({
                    "type": "transport.error",
                    "error": error.to_string(),
                    "code": error.code().as_str(),
                }),
            ),
        }
    }

    /// Runs on the poller thread whenever statistics arrive.
    fn disconnect_if_idle(&self) {
        let Some(timeout) = self.config().ok().and_then(|c| c.idle_disconnect_timeout) else {
            return;
        };
        let idle = self.inner.last_activity.load().elapsed();
        if idle < timeout {
            return;
        }
        match self.disconnect() {
            Ok(true) => info!(producer_id = %self.inner.id, ?idle, "idle producer disconnected"),
            Ok(false) => {}
            Err(e) => warn!(producer_id = %self.inner.id, error = %e, "idle disconnect failed"),
        }
    }
}
