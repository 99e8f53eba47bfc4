use super::{events, Event, Monitor};
use tracing::{debug, error, info};

/// Logs every event of a [`Monitor`] through `tracing`.
///
/// `error.occurred` is logged at error level, lifecycle and poller events at
/// info, everything else (per-message traffic) at debug.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerListener;

impl LoggerListener {
    /// Subscribes the logger to everything `monitor` emits.
    pub fn attach(monitor: &Monitor) {
        monitor.subscribe_all(|event| Self.log(event));
    }

    pub fn log(&self, event: &Event) {
        let name = event.name();
        let producer_id = event.str("producer_id").unwrap_or("-");

        if name == events::ERROR_OCCURRED {
            error!(
                producer_id,
                kind = event.str("type").unwrap_or("unknown"),
                error = event.str("error").unwrap_or(""),
                attempt = event.u64("attempt"),
                "error occurred"
            );
        } else if name.starts_with("producer.") || name.starts_with("poller.") || name.starts_with("transaction.") {
            info!(producer_id, event = name, payload = %serde_json::Value::Object(event.payload().clone()));
        } else {
            debug!(producer_id, event = name, payload = %serde_json::Value::Object(event.payload().clone()));
        }
    }
}
