//! Transaction coordination with retry, abort and reload handling.

use super::Producer;
use crate::backoff::linear_delay;
use crate::config::ProducerConfig;
use crate::error::ProducerError;
use crate::instrumentation::events;
use crate::invariants::debug_assert_attempt_bounded;
use crate::transport::{Transport, TransportError};
use crossbeam_utils::atomic::AtomicCell;
use serde_json::json;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::PoisonError;
use std::thread::{self, ThreadId};
use std::time::Instant;
use tracing::{debug, warn};

/// Marks the current thread as transaction owner while alive.
struct OwnerGuard<'a>(&'a AtomicCell<Option<ThreadId>>);

impl<'a> OwnerGuard<'a> {
    fn enter(owner: &'a AtomicCell<Option<ThreadId>>) -> Self {
        owner.store(Some(thread::current().id()));
        Self(owner)
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        self.0.store(None);
    }
}

/// A failed transaction command.
struct CommandFailure {
    error: ProducerError,
    /// The transaction was already aborted while handling the failure.
    aborted: bool,
}

impl From<ProducerError> for CommandFailure {
    fn from(error: ProducerError) -> Self {
        Self { error, aborted: false }
    }
}

impl From<TransportError> for CommandFailure {
    fn from(error: TransportError) -> Self {
        ProducerError::from(error).into()
    }
}

type Command<'a> = &'a dyn Fn(&dyn Transport) -> Result<(), TransportError>;

impl Producer {
    /// Runs `block` inside a transaction.
    ///
    /// Commits when `block` returns `Ok` and aborts when it returns `Err` or
    /// panics. Returning [`ProducerError::AbortTransaction`] rolls back
    /// without an error and yields `Ok(None)`. Called from inside a
    /// transaction on the same thread, `block` simply joins the outer one.
    ///
    /// Transactions on one producer run one at a time.
    pub fn transaction<T, F>(&self, block: F) -> Result<Option<T>, ProducerError>
    where
        F: FnOnce() -> Result<T, ProducerError>,
    {
        if !self.is_transactional()? {
            return Err(ProducerError::NotTransactional);
        }
        if self.is_transaction() {
            return block().map(Some);
        }

        let _exclusive = self
            .inner
            .transaction_mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _owner = OwnerGuard::enter(&self.inner.transaction_owner);
        self.ensure_active()?;

        self.run_transaction(block)
    }

    fn run_transaction<T, F>(&self, block: F) -> Result<Option<T>, ProducerError>
    where
        F: FnOnce() -> Result<T, ProducerError>,
    {
        let config = self.config()?;
        let started = Instant::now();

        self.run_command("begin", true, &|c: &dyn Transport| c.begin_transaction())
            .map_err(|f| f.error)?;
        self.instrument(events::TRANSACTION_STARTED, json!({}));

        let outcome = match panic::catch_unwind(AssertUnwindSafe(block)) {
            Ok(outcome) => outcome,
            Err(payload) => {
                self.abort_after_failure(config);
                self.finish_transaction(started);
                panic::resume_unwind(payload);
            }
        };

        let result = match outcome {
            Ok(value) => {
                match self.run_command("commit", true, &|c: &dyn Transport| c.commit_transaction(config.max_wait_timeout)) {
                    Ok(()) => {
                        self.inner.transactional_reloads.store(0, Ordering::Release);
                        self.instrument(events::TRANSACTION_COMMITTED, json!({}));
                        Ok(Some(value))
                    }
                    Err(failure) => {
                        if failure.aborted {
                            self.instrument(events::TRANSACTION_ABORTED, json!({}));
                        } else {
                            self.abort_after_failure(config);
                        }
                        Err(failure.error)
                    }
                }
            }
            Err(error) => {
                self.abort_after_failure(config);
                match error {
                    ProducerError::AbortTransaction => Ok(None),
                    error => Err(error),
                }
            }
        };

        self.finish_transaction(started);
        result
    }

    /// Best effort: the error that caused the abort is what the caller sees.
    fn abort_after_failure(&self, config: &ProducerConfig) {
        match self.run_command("abort", false, &|c: &dyn Transport| c.abort_transaction(config.max_wait_timeout)) {
            Ok(()) => self.instrument(events::TRANSACTION_ABORTED, json!({})),
            Err(failure) => {
                warn!(producer_id = %self.inner.id, error = %failure.error, "transaction abort failed");
            }
        }
    }

    fn finish_transaction(&self, started: Instant) {
        self.instrument(
            events::TRANSACTION_FINISHED,
            json!({ "time": started.elapsed().as_secs_f64() * 1000.0 }),
        );
    }

    /// Runs one transaction command with the layered error policy.
    ///
    /// Every failure is reported as `error.occurred`. Fatal errors may reload
    /// the transport and are then returned. Retryable errors are retried with
    /// linear backoff up to the configured attempts. Abortable errors abort
    /// the transaction when `allow_abortable` is set, which it never is for
    /// the abort command itself.
    fn run_command(&self, action: &'static str, allow_abortable: bool, command: Command<'_>) -> Result<(), CommandFailure> {
        let config = self.config()?;
        let max_attempts = config.max_attempts_on_transaction_command;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug_assert_attempt_bounded!(attempt, max_attempts);

            let client = self.client()?;
            let error = match command(client.as_ref()) {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            let retry = !error.is_fatal() && error.is_retryable() && attempt < max_attempts;
            self.instrument(
                events::ERROR_OCCURRED,
                json!({
                    "type": format!("transaction.{action}"),
                    "error": error.to_string(),
                    "code": error.code().as_str(),
                    "attempt": attempt,
                    "retry": retry,
                }),
            );

            if error.is_fatal() {
                if allow_abortable && self.transactional_reload_allowed(config, &error) {
                    let reload = self.inner.transactional_reloads.fetch_add(1, Ordering::AcqRel) + 1;
                    thread::sleep(config.wait_backoff_on_transaction_fatal_error);
                    if let Err(e) = self.reload(reload) {
                        warn!(producer_id = %self.inner.id, error = %e, "transactional reload failed");
                    }
                }
                return Err(error.into());
            }

            if retry {
                debug!(producer_id = %self.inner.id, action, attempt, error = %error, "retrying transaction command");
                thread::sleep(linear_delay(config.wait_backoff_on_transaction_command, attempt));
                continue;
            }

            if error.is_abortable() && allow_abortable {
                let aborted = self
                    .run_command("abort", false, &|c: &dyn Transport| c.abort_transaction(config.max_wait_timeout))
                    .is_ok();
                return Err(CommandFailure {
                    error: error.into(),
                    aborted,
                });
            }

            return Err(error.into());
        }
    }

    fn transactional_reload_allowed(&self, config: &ProducerConfig, error: &TransportError) -> bool {
        config.reload_on_transaction_fatal_error
            && !config.non_reloadable_transaction_errors.contains(&error.code())
            && self.inner.transactional_reloads.load(Ordering::Acquire) < config.max_attempts_on_transaction_fatal_error
    }
}
