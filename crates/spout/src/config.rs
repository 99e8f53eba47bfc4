//! Configuration for the poller and for producers.

use crate::error::ConfigError;
use crate::transport::{ErrorCode, NoopTransportBuilder, Settings, TransportBuilder};
use crate::Poller;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Settings key holding the transactional identity.
pub const TRANSACTIONAL_ID: &str = "transactional.id";

/// Settings key enabling broker-side deduplication of retried sends.
pub const ENABLE_IDEMPOTENCE: &str = "enable.idempotence";

/// Configuration of the shared poller thread.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Upper bound on one readiness wait.
    ///
    /// With nothing ready the loop wakes up at least this often to poll every
    /// client and to notice shutdown.
    ///
    /// Default: 1s
    pub poll_timeout: Duration,

    /// Name given to the background thread.
    ///
    /// Default: `spout.poller`
    pub thread_name: String,

    /// Nice value applied to the poller thread (Linux only, best effort).
    ///
    /// Default: 0
    pub thread_priority: i32,

    /// How long `shutdown` waits for the thread to exit.
    ///
    /// Default: 5s
    pub shutdown_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            thread_name: "spout.poller".to_owned(),
            thread_priority: 0,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl PollerConfig {
    /// Sets the readiness wait timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the background thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Sets the background thread priority.
    pub fn with_thread_priority(mut self, priority: i32) -> Self {
        self.thread_priority = priority;
        self
    }

    /// Sets the bounded join timeout used by `shutdown`.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Per-producer polling behavior.
#[derive(Debug, Clone, Copy)]
pub struct PollingConfig {
    /// Time budget for draining one client's event queue in a single pass.
    ///
    /// Default: 100ms
    pub max_poll_time: Duration,

    /// Longest a client may go without being polled, even when idle.
    ///
    /// Default: 1s
    pub periodic_poll_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_poll_time: Duration::from_millis(100),
            periodic_poll_interval: Duration::from_secs(1),
        }
    }
}

impl PollingConfig {
    /// Sets the per-pass drain budget.
    pub fn with_max_poll_time(mut self, max_poll_time: Duration) -> Self {
        self.max_poll_time = max_poll_time;
        self
    }

    /// Sets the periodic poll interval.
    pub fn with_periodic_poll_interval(mut self, interval: Duration) -> Self {
        self.periodic_poll_interval = interval;
        self
    }
}

/// Producer configuration.
///
/// Built from the [`TransportBuilder`] that creates the underlying client;
/// every other setting has a default.
#[derive(Clone)]
pub struct ProducerConfig {
    /// Builds transport clients on connect and on reload.
    pub transport: Arc<dyn TransportBuilder>,
    /// When `false`, a no-op transport is used and nothing leaves the process.
    pub deliver: bool,
    /// Settings handed to the transport builder.
    pub settings: Settings,
    /// Largest payload accepted by local validation.
    pub max_payload_size: usize,
    /// How long sync dispatch waits for a delivery report.
    pub max_wait_timeout: Duration,
    /// Retry `queue_full` rejections instead of raising them.
    pub wait_on_queue_full: bool,
    /// Pause between queue-full retries.
    pub wait_backoff_on_queue_full: Duration,
    /// Give up on a full queue after this long.
    pub wait_timeout_on_queue_full: Duration,
    /// Emit `error.occurred` for every queue-full retry.
    pub instrument_on_wait_queue_full: bool,
    /// Rebuild the client when an idempotent producer hits a fatal error.
    pub reload_on_idempotent_fatal_error: bool,
    /// Pause before each idempotent reload.
    pub wait_backoff_on_idempotent_fatal_error: Duration,
    /// Reloads allowed per dispatch call.
    pub max_attempts_on_idempotent_fatal_error: u32,
    /// Fatal codes that never trigger an idempotent reload.
    pub non_reloadable_errors: Vec<ErrorCode>,
    /// Rebuild the client when a transactional producer hits a fatal error.
    pub reload_on_transaction_fatal_error: bool,
    /// Pause before each transactional reload.
    pub wait_backoff_on_transaction_fatal_error: Duration,
    /// Transactional reloads allowed before the next successful commit.
    pub max_attempts_on_transaction_fatal_error: u32,
    /// Fatal codes that never trigger a transactional reload.
    pub non_reloadable_transaction_errors: Vec<ErrorCode>,
    /// Base of the linear backoff between retried transaction commands.
    pub wait_backoff_on_transaction_command: Duration,
    /// Attempts per transaction command before giving up.
    pub max_attempts_on_transaction_command: u32,
    /// Disconnect the transport after this much inactivity.
    pub idle_disconnect_timeout: Option<Duration>,
    /// Polling behavior on the shared poller.
    pub polling: PollingConfig,
    /// Poller to register with; the process-wide one when `None`.
    pub poller: Option<Poller>,
}

impl ProducerConfig {
    /// Creates a configuration with defaults for everything but the transport.
    pub fn new(transport: impl TransportBuilder + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            deliver: true,
            settings: Settings::new(),
            max_payload_size: 1_000_012,
            max_wait_timeout: Duration::from_secs(5),
            wait_on_queue_full: true,
            wait_backoff_on_queue_full: Duration::from_millis(100),
            wait_timeout_on_queue_full: Duration::from_secs(10),
            instrument_on_wait_queue_full: true,
            reload_on_idempotent_fatal_error: false,
            wait_backoff_on_idempotent_fatal_error: Duration::from_secs(5),
            max_attempts_on_idempotent_fatal_error: 5,
            non_reloadable_errors: vec![ErrorCode::Fenced],
            reload_on_transaction_fatal_error: true,
            wait_backoff_on_transaction_fatal_error: Duration::from_secs(1),
            max_attempts_on_transaction_fatal_error: 10,
            non_reloadable_transaction_errors: vec![ErrorCode::Fenced],
            wait_backoff_on_transaction_command: Duration::from_millis(15),
            max_attempts_on_transaction_command: 5,
            idle_disconnect_timeout: None,
            polling: PollingConfig::default(),
            poller: None,
        }
    }

    /// A configuration that never delivers anything.
    pub fn dummy() -> Self {
        Self::new(NoopTransportBuilder).with_deliver(false)
    }

    /// Sets a transport setting.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Marks the producer transactional under `id`.
    pub fn with_transactional_id(self, id: impl Into<String>) -> Self {
        self.with_setting(TRANSACTIONAL_ID, id)
    }

    /// Enables idempotent delivery.
    pub fn with_idempotence(self) -> Self {
        self.with_setting(ENABLE_IDEMPOTENCE, "true")
    }

    pub fn with_deliver(mut self, deliver: bool) -> Self {
        self.deliver = deliver;
        self
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_max_wait_timeout(mut self, timeout: Duration) -> Self {
        self.max_wait_timeout = timeout;
        self
    }

    /// Configures queue-full waiting.
    pub fn with_wait_on_queue_full(mut self, wait: bool, backoff: Duration, timeout: Duration) -> Self {
        self.wait_on_queue_full = wait;
        self.wait_backoff_on_queue_full = backoff;
        self.wait_timeout_on_queue_full = timeout;
        self
    }

    /// Enables idempotent reloads with the given backoff and cap.
    pub fn with_idempotent_reload(mut self, backoff: Duration, max_attempts: u32) -> Self {
        self.reload_on_idempotent_fatal_error = true;
        self.wait_backoff_on_idempotent_fatal_error = backoff;
        self.max_attempts_on_idempotent_fatal_error = max_attempts;
        self
    }

    /// Configures transactional reloads.
    pub fn with_transaction_reload(mut self, enabled: bool, backoff: Duration, max_attempts: u32) -> Self {
        self.reload_on_transaction_fatal_error = enabled;
        self.wait_backoff_on_transaction_fatal_error = backoff;
        self.max_attempts_on_transaction_fatal_error = max_attempts;
        self
    }

    /// Configures transaction command retries.
    pub fn with_transaction_retries(mut self, backoff: Duration, max_attempts: u32) -> Self {
        self.wait_backoff_on_transaction_command = backoff;
        self.max_attempts_on_transaction_command = max_attempts;
        self
    }

    pub fn with_non_reloadable_errors(mut self, codes: Vec<ErrorCode>) -> Self {
        self.non_reloadable_errors = codes;
        self
    }

    pub fn with_non_reloadable_transaction_errors(mut self, codes: Vec<ErrorCode>) -> Self {
        self.non_reloadable_transaction_errors = codes;
        self
    }

    pub fn with_idle_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.idle_disconnect_timeout = Some(timeout);
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    /// Registers with `poller` instead of the process-wide instance.
    pub fn with_poller(mut self, poller: Poller) -> Self {
        self.poller = Some(poller);
        self
    }

    /// The transactional id, if one is configured.
    pub fn transactional_id(&self) -> Option<&str> {
        self.settings
            .get(TRANSACTIONAL_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Transactional producers are always idempotent.
    pub fn is_idempotent(&self) -> bool {
        self.transactional_id().is_some()
            || self
                .settings
                .get(ENABLE_IDEMPOTENCE)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Checks the settings that would otherwise fail late or loop forever.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_payload_size", self.max_payload_size as u128),
            ("max_wait_timeout", self.max_wait_timeout.as_nanos()),
            ("max_attempts_on_transaction_command", self.max_attempts_on_transaction_command as u128),
            ("max_attempts_on_idempotent_fatal_error", self.max_attempts_on_idempotent_fatal_error as u128),
            ("max_attempts_on_transaction_fatal_error", self.max_attempts_on_transaction_fatal_error as u128),
            ("polling.max_poll_time", self.polling.max_poll_time.as_nanos()),
            ("polling.periodic_poll_interval", self.polling.periodic_poll_interval.as_nanos()),
            (
                "idle_disconnect_timeout",
                self.idle_disconnect_timeout.map_or(1, |t| t.as_nanos()),
            ),
        ];

        match positive.iter().find(|(_, value)| *value == 0) {
            Some(&(field, _)) => Err(ConfigError::MustBePositive { field }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ProducerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerConfig")
            .field("deliver", &self.deliver)
            .field("settings", &self.settings)
            .field("max_payload_size", &self.max_payload_size)
            .field("max_wait_timeout", &self.max_wait_timeout)
            .field("idle_disconnect_timeout", &self.idle_disconnect_timeout)
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ProducerConfig::dummy();
        assert!(config.validate().is_ok());
        assert!(!config.deliver);
        assert_eq!(config.non_reloadable_errors, vec![ErrorCode::Fenced]);
        assert!(config.transactional_id().is_none());
        assert!(!config.is_idempotent());
    }

    #[test]
    fn test_transactional_implies_idempotent() {
        let config = ProducerConfig::dummy().with_transactional_id("tx-1");
        assert_eq!(config.transactional_id(), Some("tx-1"));
        assert!(config.is_idempotent());

        let config = ProducerConfig::dummy().with_setting(TRANSACTIONAL_ID, "");
        assert!(config.transactional_id().is_none());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = ProducerConfig::dummy().with_transaction_retries(Duration::ZERO, 0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MustBePositive {
                field: "max_attempts_on_transaction_command"
            })
        );

        let config = ProducerConfig::dummy().with_idle_disconnect_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ProducerConfig::dummy()
            .with_polling(PollingConfig::default().with_max_poll_time(Duration::ZERO));
        assert!(config.validate().is_err());
    }
}
