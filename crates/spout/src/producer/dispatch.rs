//! Sync and async message dispatch.

use super::Producer;
use crate::config::ProducerConfig;
use crate::error::ProducerError;
use crate::instrumentation::events;
use crate::invariants::debug_assert_attempt_bounded;
use crate::transport::{DeliveryHandle, DeliveryReport, Message, Settings, TransportError};
use serde_json::json;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-call overrides of the producer configuration.
///
/// Passed explicitly through [`Producer::variant`] rather than kept as
/// ambient per-thread state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Replaces `max_wait_timeout` for sync dispatch.
    pub max_wait_timeout: Option<Duration>,
    /// Topic-level settings handed to the transport with every message.
    pub topic_settings: Settings,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_wait_timeout(mut self, timeout: Duration) -> Self {
        self.max_wait_timeout = Some(timeout);
        self
    }

    pub fn with_topic_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.topic_settings.insert(key.into(), value.into());
        self
    }
}

/// A producer bound to a set of [`DispatchOptions`].
#[derive(Debug, Clone)]
pub struct Variant<'a> {
    producer: &'a Producer,
    options: DispatchOptions,
}

impl Variant<'_> {
    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    pub fn produce_sync(&self, message: Message) -> Result<DeliveryReport, ProducerError> {
        self.producer.dispatch_sync(&message, &self.options)
    }

    pub fn produce_async(&self, message: Message) -> Result<DeliveryHandle, ProducerError> {
        self.producer.dispatch_async(&message, &self.options)
    }

    pub fn produce_many_sync(&self, messages: Vec<Message>) -> Result<Vec<DeliveryReport>, ProducerError> {
        self.producer.dispatch_many_sync(&messages, &self.options)
    }

    pub fn produce_many_async(&self, messages: Vec<Message>) -> Result<Vec<DeliveryHandle>, ProducerError> {
        self.producer.dispatch_many_async(&messages, &self.options)
    }
}

impl Producer {
    /// Binds `options` to this producer for subsequent calls.
    pub fn variant(&self, options: DispatchOptions) -> Variant<'_> {
        Variant {
            producer: self,
            options,
        }
    }

    /// Produces one message and waits for its delivery report.
    pub fn produce_sync(&self, message: Message) -> Result<DeliveryReport, ProducerError> {
        self.dispatch_sync(&message, &DispatchOptions::default())
    }

    /// Produces one message and returns without waiting for delivery.
    pub fn produce_async(&self, message: Message) -> Result<DeliveryHandle, ProducerError> {
        self.dispatch_async(&message, &DispatchOptions::default())
    }

    /// Produces every message, then waits for all delivery reports.
    pub fn produce_many_sync(&self, messages: Vec<Message>) -> Result<Vec<DeliveryReport>, ProducerError> {
        self.dispatch_many_sync(&messages, &DispatchOptions::default())
    }

    /// Produces every message without waiting for delivery.
    pub fn produce_many_async(&self, messages: Vec<Message>) -> Result<Vec<DeliveryHandle>, ProducerError> {
        self.dispatch_many_async(&messages, &DispatchOptions::default())
    }

    pub(crate) fn dispatch_sync(&self, message: &Message, options: &DispatchOptions) -> Result<DeliveryReport, ProducerError> {
        let result = self.prepare(std::slice::from_ref(message)).and_then(|config| {
            let timeout = options.max_wait_timeout.unwrap_or(config.max_wait_timeout);
            self.in_transaction(|| {
                self.with_reload(config, || {
                    self.produce_with_wait(config, message, options, "message.produce_sync")?
                        .wait(timeout)
                })
            })
        });
        match result {
            Ok(report) => {
                self.instrument(
                    events::MESSAGE_PRODUCED_SYNC,
                    json!({ "topic": message.topic, "partition": report.partition, "offset": report.offset }),
                );
                Ok(report)
            }
            Err(e) => Err(self.report_failure("message.produce_sync", e, 0)),
        }
    }

    pub(crate) fn dispatch_async(&self, message: &Message, options: &DispatchOptions) -> Result<DeliveryHandle, ProducerError> {
        let result = self.prepare(std::slice::from_ref(message)).and_then(|config| {
            self.in_transaction(|| {
                self.with_reload(config, || {
                    self.produce_with_wait(config, message, options, "message.produce_async")
                })
            })
        });
        match result {
            Ok(handle) => {
                self.instrument(events::MESSAGE_PRODUCED_ASYNC, json!({ "topic": message.topic }));
                Ok(handle)
            }
            Err(e) => Err(self.report_failure("message.produce_async", e, 0)),
        }
    }

    pub(crate) fn dispatch_many_sync(
        &self,
        messages: &[Message],
        options: &DispatchOptions,
    ) -> Result<Vec<DeliveryReport>, ProducerError> {
        let mut handles = Vec::with_capacity(messages.len());
        let result = self.prepare(messages).and_then(|config| {
            let timeout = options.max_wait_timeout.unwrap_or(config.max_wait_timeout);
            self.in_transaction(|| {
                self.with_reload(config, || {
                    handles.clear();
                    for message in messages {
                        handles.push(self.produce_with_wait(config, message, options, "messages.produce_many_sync")?);
                    }
                    handles.iter().map(|h| h.wait(timeout)).collect::<Result<Vec<_>, _>>()
                })
            })
        });
        match result {
            Ok(reports) => {
                self.instrument(events::MESSAGES_PRODUCED_SYNC, json!({ "messages": reports.len() }));
                Ok(reports)
            }
            Err(e) => Err(self.report_failure("messages.produce_many_sync", e, handles.len())),
        }
    }

    pub(crate) fn dispatch_many_async(
        &self,
        messages: &[Message],
        options: &DispatchOptions,
    ) -> Result<Vec<DeliveryHandle>, ProducerError> {
        let mut handles = Vec::with_capacity(messages.len());
        let result = self.prepare(messages).and_then(|config| {
            self.in_transaction(|| {
                self.with_reload(config, || {
                    handles.clear();
                    for message in messages {
                        handles.push(self.produce_with_wait(config, message, options, "messages.produce_many_async")?);
                    }
                    Ok(())
                })
            })
        });
        match result {
            Ok(()) => {
                self.instrument(events::MESSAGES_PRODUCED_ASYNC, json!({ "messages": handles.len() }));
                Ok(handles)
            }
            Err(e) => Err(self.report_failure("messages.produce_many_async", e, handles.len())),
        }
    }

    /// Lifecycle check and validation shared by every dispatch.
    pub(super) fn prepare(&self, messages: &[Message]) -> Result<&ProducerConfig, ProducerError> {
        self.ensure_active()?;
        let config = self.config()?;
        for message in messages {
            validate(config, message)?;
        }
        self.touch();
        Ok(config)
    }

    /// Runs `f` inside a transaction when the producer is transactional.
    fn in_transaction<T>(&self, f: impl FnOnce() -> Result<T, ProducerError>) -> Result<T, ProducerError> {
        if !self.is_transactional()? {
            return f();
        }
        self.transaction(f)?.ok_or(ProducerError::AbortTransaction)
    }

    /// Retries `f` after rebuilding the transport when an idempotent,
    /// non-transactional producer hits a reloadable fatal error.
    fn with_reload<T>(
        &self,
        config: &ProducerConfig,
        mut f: impl FnMut() -> Result<T, ProducerError>,
    ) -> Result<T, ProducerError> {
        let mut attempts: u32 = 0;
        loop {
            match f() {
                Err(ProducerError::Transport(e)) if idempotent_reload_allowed(config, &e, attempts) => {
                    attempts += 1;
                    debug_assert_attempt_bounded!(attempts, config.max_attempts_on_idempotent_fatal_error);
                    warn!(
                        producer_id = %self.inner.id,
                        attempt = attempts,
                        error = %e,
                        "fatal error on idempotent producer, reloading"
                    );
                    thread::sleep(config.wait_backoff_on_idempotent_fatal_error);
                    self.reload(attempts)?;
                }
                other => return other,
            }
        }
    }

    /// Hands one message to the transport, waiting out a full local queue.
    fn produce_with_wait(
        &self,
        config: &ProducerConfig,
        message: &Message,
        options: &DispatchOptions,
        operation: &str,
    ) -> Result<DeliveryHandle, ProducerError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let client = self.client()?;
            match client.produce(message, &options.topic_settings) {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_queue_full() && config.wait_on_queue_full => {
                    attempt += 1;
                    if started.elapsed() >= config.wait_timeout_on_queue_full {
                        return Err(e.into());
                    }
                    if config.instrument_on_wait_queue_full {
                        self.instrument(
                            events::ERROR_OCCURRED,
                            json!({
                                "type": operation,
                                "error": e.to_string(),
                                "code": e.code().as_str(),
                                "attempt": attempt,
                                "retry": true,
                            }),
                        );
                    }
                    thread::sleep(config.wait_backoff_on_queue_full);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Emits `error.occurred` for a failed dispatch and hands the error back.
    fn report_failure(&self, operation: &str, error: ProducerError, dispatched: usize) -> ProducerError {
        self.instrument(
            events::ERROR_OCCURRED,
            json!({
                "type": operation,
                "error": error.to_string(),
                "code": error.code().map(|c| c.as_str()),
                "dispatched": dispatched,
            }),
        );
        error
    }
}

fn idempotent_reload_allowed(config: &ProducerConfig, error: &TransportError, attempts: u32) -> bool {
    config.reload_on_idempotent_fatal_error
        && config.is_idempotent()
        && config.transactional_id().is_none()
        && error.is_fatal()
        && !config.non_reloadable_errors.contains(&error.code())
        && attempts < config.max_attempts_on_idempotent_fatal_error
}

fn validate(config: &ProducerConfig, message: &Message) -> Result<(), ProducerError> {
    if message.topic.is_empty() {
        return Err(ProducerError::MessageInvalid("topic must not be empty".to_owned()));
    }
    if message.size() > config.max_payload_size {
        return Err(ProducerError::MessageInvalid(format!(
            "payload of {} bytes exceeds max_payload_size {}",
            message.size(),
            config.max_payload_size
        )));
    }
    if message.headers.iter().any(|(name, _)| name.is_empty()) {
        return Err(ProducerError::MessageInvalid("header names must not be empty".to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NoopTransportBuilder;

    #[test]
    fn test_validation() {
        let config = ProducerConfig::new(NoopTransportBuilder).with_max_payload_size(4);
        assert!(validate(&config, &Message::new("t", b"1234".to_vec())).is_ok());
        assert!(validate(&config, &Message::tombstone("t", b"k".to_vec())).is_ok());
        assert!(matches!(
            validate(&config, &Message::new("t", b"12345".to_vec())),
            Err(ProducerError::MessageInvalid(_))
        ));
        assert!(validate(&config, &Message::new("", b"1".to_vec())).is_err());
        assert!(validate(&config, &Message::new("t", b"1".to_vec()).with_header("", b"v".to_vec())).is_err());
    }

    #[test]
    fn test_reload_policy() {
        let fatal = TransportError::fatal(crate::transport::ErrorCode::Fatal, "gone");
        let fenced = TransportError::fatal(crate::transport::ErrorCode::Fenced, "fenced");

        let config = ProducerConfig::dummy().with_idempotence();
        assert!(!idempotent_reload_allowed(&config, &fatal, 0));

        let config = config.with_idempotent_reload(Duration::ZERO, 2);
        assert!(idempotent_reload_allowed(&config, &fatal, 1));
        assert!(!idempotent_reload_allowed(&config, &fatal, 2));
        assert!(!idempotent_reload_allowed(&config, &fenced, 0));
        assert!(!idempotent_reload_allowed(
            &config,
            &TransportError::retryable(crate::transport::ErrorCode::TimedOut, "slow"),
            0
        ));

        let config = config.with_transactional_id("tx");
        assert!(!idempotent_reload_allowed(&config, &fatal, 0));
    }

    #[test]
    fn test_options_builder() {
        let options = DispatchOptions::new()
            .with_max_wait_timeout(Duration::from_millis(5))
            .with_topic_setting("acks", "all");
        assert_eq!(options.max_wait_timeout, Some(Duration::from_millis(5)));
        assert_eq!(options.topic_settings.get("acks").map(String::as_str), Some("all"));
    }
}
