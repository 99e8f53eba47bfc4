use crate::error::InstrumentationError;
use serde_json::{Map, Value};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

/// Names of every event a producer or poller emits.
pub mod events {
    pub const PRODUCER_CONNECTED: &str = "producer.connected";
    pub const PRODUCER_CLOSING: &str = "producer.closing";
    pub const PRODUCER_CLOSED: &str = "producer.closed";
    pub const PRODUCER_DISCONNECTING: &str = "producer.disconnecting";
    pub const PRODUCER_DISCONNECTED: &str = "producer.disconnected";
    pub const PRODUCER_RELOADED: &str = "producer.reloaded";

    pub const POLLER_PRODUCER_REGISTERED: &str = "poller.producer_registered";
    pub const POLLER_PRODUCER_UNREGISTERED: &str = "poller.producer_unregistered";

    pub const MESSAGE_PRODUCED_SYNC: &str = "message.produced_sync";
    pub const MESSAGE_PRODUCED_ASYNC: &str = "message.produced_async";
    pub const MESSAGES_PRODUCED_SYNC: &str = "messages.produced_sync";
    pub const MESSAGES_PRODUCED_ASYNC: &str = "messages.produced_async";
    pub const MESSAGE_BUFFERED: &str = "message.buffered";
    pub const MESSAGES_BUFFERED: &str = "messages.buffered";
    pub const MESSAGE_ACKNOWLEDGED: &str = "message.acknowledged";
    pub const MESSAGE_PURGED: &str = "message.purged";

    pub const BUFFER_FLUSHED_SYNC: &str = "buffer.flushed_sync";
    pub const BUFFER_FLUSHED_ASYNC: &str = "buffer.flushed_async";
    pub const BUFFER_PURGED: &str = "buffer.purged";

    pub const STATISTICS_EMITTED: &str = "statistics.emitted";
    pub const ERROR_OCCURRED: &str = "error.occurred";

    pub const TRANSACTION_STARTED: &str = "transaction.started";
    pub const TRANSACTION_COMMITTED: &str = "transaction.committed";
    pub const TRANSACTION_ABORTED: &str = "transaction.aborted";
    pub const TRANSACTION_FINISHED: &str = "transaction.finished";

    /// Every name above. Subscriptions to anything else are rejected.
    pub const ALL: &[&str] = &[
        PRODUCER_CONNECTED,
        PRODUCER_CLOSING,
        PRODUCER_CLOSED,
        PRODUCER_DISCONNECTING,
        PRODUCER_DISCONNECTED,
        PRODUCER_RELOADED,
        POLLER_PRODUCER_REGISTERED,
        POLLER_PRODUCER_UNREGISTERED,
        MESSAGE_PRODUCED_SYNC,
        MESSAGE_PRODUCED_ASYNC,
        MESSAGES_PRODUCED_SYNC,
        MESSAGES_PRODUCED_ASYNC,
        MESSAGE_BUFFERED,
        MESSAGES_BUFFERED,
        MESSAGE_ACKNOWLEDGED,
        MESSAGE_PURGED,
        BUFFER_FLUSHED_SYNC,
        BUFFER_FLUSHED_ASYNC,
        BUFFER_PURGED,
        STATISTICS_EMITTED,
        ERROR_OCCURRED,
        TRANSACTION_STARTED,
        TRANSACTION_COMMITTED,
        TRANSACTION_ABORTED,
        TRANSACTION_FINISHED,
    ];
}

/// One emitted event: a name plus a read-only key/value payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    name: String,
    payload: Map<String, Value>,
}

impl Event {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// String field shortcut, e.g. `event.str("type")` on `error.occurred`.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer field shortcut.
    pub fn u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

/// Callback registered on a [`Monitor`].
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    /// `None` receives everything.
    event: Option<String>,
    listener: Listener,
}

/// Publish/subscribe hub for producer and poller events.
///
/// Listeners run synchronously on the emitting thread, which for delivery
/// reports and statistics is the poller thread. They are invoked outside the
/// subscription lock, so a listener may subscribe further listeners or emit
/// events itself. A panicking listener is logged and skipped.
#[derive(Default)]
pub struct Monitor {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to one named event.
    pub fn subscribe<F>(&self, event: &str, listener: F) -> Result<(), InstrumentationError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if !events::ALL.contains(&event) {
            return Err(InstrumentationError::UnknownEvent(event.to_owned()));
        }
        self.push(Some(event.to_owned()), Arc::new(listener));
        Ok(())
    }

    /// Subscribes `listener` to every event.
    pub fn subscribe_all<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.push(None, Arc::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Emits `name` with `payload` to every matching listener.
    ///
    /// A non-object payload is stored under the `value` key.
    pub fn instrument(&self, name: &str, payload: Value) {
        let listeners: Vec<Listener> = {
            let subscriptions = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
            subscriptions
                .iter()
                .filter(|s| s.event.as_deref().map_or(true, |e| e == name))
                .map(|s| Arc::clone(&s.listener))
                .collect()
        };
        if listeners.is_empty() {
            return;
        }

        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_owned(), other);
                map
            }
        };
        let event = Event {
            name: name.to_owned(),
            payload,
        };

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(event = name, "instrumentation listener panicked");
            }
        }
    }

    fn push(&self, event: Option<String>, listener: Listener) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { event, listener });
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_unknown_event_rejected() {
        let monitor = Monitor::new();
        let err = monitor.subscribe("producer.exploded", |_| {}).unwrap_err();
        assert_eq!(err, InstrumentationError::UnknownEvent("producer.exploded".into()));
        assert_eq!(monitor.listener_count(), 0);
    }

    #[test]
    fn test_routes_by_name() {
        let monitor = Monitor::new();
        let named = Arc::new(Mutex::new(Vec::new()));
        let all = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&named);
        monitor
            .subscribe(events::PRODUCER_CLOSED, move |e| sink.lock().unwrap().push(e.clone()))
            .unwrap();
        let sink = Arc::clone(&all);
        monitor.subscribe_all(move |e| sink.lock().unwrap().push(e.name().to_owned()));

        monitor.instrument(events::PRODUCER_CLOSING, json!({"producer_id": "p"}));
        monitor.instrument(events::PRODUCER_CLOSED, json!({"producer_id": "p"}));

        let named = named.lock().unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].str("producer_id"), Some("p"));
        assert_eq!(all.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_listener_panic_is_contained() {
        let monitor = Monitor::new();
        let reached = Arc::new(Mutex::new(0));

        monitor.subscribe_all(|_| panic!("listener bug"));
        let count = Arc::clone(&reached);
        monitor.subscribe_all(move |_| *count.lock().unwrap() += 1);

        monitor.instrument(events::ERROR_OCCURRED, json!({"type": "test"}));
        assert_eq!(*reached.lock().unwrap(), 1);
    }

    #[test]
    fn test_scalar_payload_wrapped() {
        let monitor = Monitor::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        monitor.subscribe_all(move |e| *sink.lock().unwrap() = e.u64("value"));

        monitor.instrument(events::PRODUCER_RELOADED, json!(3));
        assert_eq!(*seen.lock().unwrap(), Some(3));
    }
}
