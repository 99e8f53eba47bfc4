//! The producer: lifecycle, dispatch, buffering and transactions.
//!
//! A [`Producer`] is a cheap handle; clones share one underlying client.
//! The transport is created lazily on first use, registered with a
//! [`Poller`] for event delivery, and may be dropped and rebuilt during the
//! producer's life (idle disconnect, reload after a fatal error).
//!
//! # Locks
//!
//! - `operating` serializes connect, disconnect, reload and close.
//! - `transaction_mutex` allows one transaction at a time; the owning thread
//!   may re-enter through `transaction_owner`.
//!
//! Neither lock is ever acquired blocking on the poller thread: callbacks
//! only use `try_lock`, so a caller holding `operating` while waiting for the
//! poller in `unregister` cannot deadlock with it.

mod buffer;
mod callbacks;
mod dispatch;
mod status;
mod transactions;

pub use dispatch::{DispatchOptions, Variant};
pub use status::Status;

use crate::config::ProducerConfig;
use crate::error::ProducerError;
use crate::instrumentation::{events, Monitor};
use crate::polling::Poller;
use crate::transport::{BuildContext, Message, NoopTransport, Transport};
use crossbeam_utils::atomic::AtomicCell;
use serde_json::{json, Value};
use status::StatusCell;
use std::fmt;
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};
use std::thread::{self, ThreadId};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Produces messages through a [`Transport`].
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    id: String,
    status: StatusCell,
    config: OnceLock<ProducerConfig>,
    monitor: Arc<Monitor>,
    client: Mutex<Option<Arc<dyn Transport>>>,
    operating: Mutex<()>,
    transaction_mutex: Mutex<()>,
    transaction_owner: AtomicCell<Option<ThreadId>>,
    closing_thread: AtomicCell<Option<ThreadId>>,
    buffer: Mutex<Vec<Message>>,
    /// Process that created the current transport; 0 before the first connect.
    pid: AtomicU32,
    last_activity: AtomicCell<Instant>,
    transactional_reloads: AtomicU32,
}

impl Default for Producer {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer {
    /// Creates an unconfigured producer with a random id.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                id: uuid::Uuid::new_v4().to_string(),
                status: StatusCell::new(),
                config: OnceLock::new(),
                monitor: Arc::new(Monitor::new()),
                client: Mutex::new(None),
                operating: Mutex::new(()),
                transaction_mutex: Mutex::new(()),
                transaction_owner: AtomicCell::new(None),
                closing_thread: AtomicCell::new(None),
                buffer: Mutex::new(Vec::new()),
                pid: AtomicU32::new(0),
                last_activity: AtomicCell::new(Instant::now()),
                transactional_reloads: AtomicU32::new(0),
            }),
        }
    }

    /// Creates and sets up a producer in one step.
    pub fn with_config(config: ProducerConfig) -> Result<Self, ProducerError> {
        let producer = Self::new();
        producer.setup(config)?;
        Ok(producer)
    }

    /// Applies the configuration. Allowed once, on an initial producer.
    pub fn setup(&self, config: ProducerConfig) -> Result<(), ProducerError> {
        let _operating = self.lock_operating();
        if !self.inner.status.get()?.is_initial() {
            return Err(ProducerError::AlreadyConfigured);
        }
        config.validate()?;
        self.inner
            .config
            .set(config)
            .map_err(|_| ProducerError::AlreadyConfigured)?;
        self.inner.status.set(Status::Configured);
        debug!(producer_id = %self.inner.id, "producer configured");
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> Result<Status, ProducerError> {
        self.inner.status.get()
    }

    /// Event hub for this producer.
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.inner.monitor
    }

    pub fn config(&self) -> Result<&ProducerConfig, ProducerError> {
        self.inner.config.get().ok_or(ProducerError::NotConfigured)
    }

    pub fn is_transactional(&self) -> Result<bool, ProducerError> {
        Ok(self.config()?.transactional_id().is_some())
    }

    pub fn is_idempotent(&self) -> Result<bool, ProducerError> {
        Ok(self.config()?.is_idempotent())
    }

    /// Whether the calling thread is inside this producer's transaction.
    pub fn is_transaction(&self) -> bool {
        self.inner.transaction_owner.load() == Some(thread::current().id())
    }

    /// Number of locally buffered messages.
    pub fn buffered(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Releases the transport after inactivity, keeping the producer usable.
    ///
    /// Does nothing (and returns `false`) unless connected with no
    /// transaction in progress, nothing buffered, and no other lifecycle
    /// operation running.
    pub fn disconnect(&self) -> Result<bool, ProducerError> {
        if !self.inner.status.get()?.is_connected()
            || self.inner.transaction_owner.load().is_some()
            || self.buffered() > 0
        {
            return Ok(false);
        }
        let _operating = match self.inner.operating.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };
        let _transaction = match self.inner.transaction_mutex.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };
        if !self.inner.status.get()?.is_connected() {
            return Ok(false);
        }

        self.inner.status.set(Status::Disconnecting);
        self.instrument(events::PRODUCER_DISCONNECTING, json!({}));

        let client = self.lock_client().take();
        if let Some(client) = client {
            self.poller()?.unregister(&self.inner.id);
            client.close();
        }

        self.inner.status.set(Status::Disconnected);
        self.instrument(events::PRODUCER_DISCONNECTED, json!({}));
        info!(producer_id = %self.inner.id, "producer disconnected");
        Ok(true)
    }

    /// Flushes everything and releases the transport. Idempotent.
    pub fn close(&self) -> Result<(), ProducerError> {
        self.close_with(false)
    }

    /// Like [`close`](Self::close), but purges pending messages instead of
    /// waiting for them.
    pub fn close_force(&self) -> Result<(), ProducerError> {
        self.close_with(true)
    }

    fn close_with(&self, force: bool) -> Result<(), ProducerError> {
        if self.is_transaction() {
            return Err(ProducerError::ClosingInTransaction);
        }
        // Checked before locking: a listener closing the producer from inside
        // this producer's own teardown must not wait on `operating`.
        if matches!(self.inner.status.get()?, Status::Closing | Status::Closed) {
            return Ok(());
        }

        let _operating = self.lock_operating();
        match self.inner.status.get()? {
            Status::Closing | Status::Closed => return Ok(()),
            // Nothing was ever connected and nothing waits to be sent.
            Status::Initial => {
                self.inner.status.set(Status::Closed);
                self.instrument(events::PRODUCER_CLOSED, json!({}));
                return Ok(());
            }
            Status::Configured if force || self.buffered() == 0 => {
                self.lock_buffer().clear();
                self.inner.status.set(Status::Closed);
                self.instrument(events::PRODUCER_CLOSED, json!({}));
                return Ok(());
            }
            Status::Configured | Status::Connected | Status::Disconnecting | Status::Disconnected => {}
        }

        self.inner.closing_thread.store(Some(thread::current().id()));
        self.inner.status.set(Status::Closing);
        self.instrument(events::PRODUCER_CLOSING, json!({ "force": force }));

        let result = self.teardown(force);

        self.inner.status.set(Status::Closed);
        self.inner.closing_thread.store(None);
        self.instrument(events::PRODUCER_CLOSED, json!({}));
        info!(producer_id = %self.inner.id, force, "producer closed");
        result
    }

    fn teardown(&self, force: bool) -> Result<(), ProducerError> {
        let config = self.config()?;
        let mut first_error = None;

        if force {
            self.lock_buffer().clear();
        } else if let Err(e) = self.flush_sync() {
            first_error = Some(e);
        }

        let client = self.lock_client().take();
        if let Some(client) = client {
            let drained = if force {
                client.purge()
            } else {
                client.flush(config.max_wait_timeout)
            };
            if let Err(e) = drained {
                warn!(producer_id = %self.inner.id, error = %e, "transport did not drain before close");
                self.instrument(
                    events::ERROR_OCCURRED,
                    json!({ "type": "producer.close", "error": e.to_string(), "code": e.code().as_str() }),
                );
                first_error.get_or_insert(e.into());
            }
            self.poller()?.unregister(&self.inner.id);
            client.close();
        }

        first_error.map_or(Ok(()), Err)
    }

    /// The transport to use right now, connecting if needed.
    pub(crate) fn client(&self) -> Result<Arc<dyn Transport>, ProducerError> {
        match self.inner.status.get()? {
            Status::Initial => Err(ProducerError::NotConfigured),
            Status::Closed => Err(ProducerError::Closed),
            Status::Closing if self.is_closing_thread() => match self.current_client() {
                Some(client) => Ok(client),
                // Closed while disconnected with messages still buffered.
                // The closing thread already holds `operating`.
                None => {
                    let client = self.build_client()?;
                    *self.lock_client() = Some(Arc::clone(&client));
                    Ok(client)
                }
            },
            Status::Closing => Err(ProducerError::Closed),
            Status::Connected => {
                self.check_fork()?;
                match self.current_client() {
                    Some(client) => Ok(client),
                    None => self.connect(),
                }
            }
            Status::Configured | Status::Disconnecting | Status::Disconnected => self.connect(),
        }
    }

    /// Fails fast unless the producer may dispatch.
    pub(crate) fn ensure_active(&self) -> Result<(), ProducerError> {
        match self.inner.status.get()? {
            Status::Initial => Err(ProducerError::NotConfigured),
            Status::Closing if self.is_closing_thread() => Ok(()),
            Status::Closing | Status::Closed => Err(ProducerError::Closed),
            Status::Configured | Status::Connected | Status::Disconnecting | Status::Disconnected => Ok(()),
        }
    }

    fn connect(&self) -> Result<Arc<dyn Transport>, ProducerError> {
        let _operating = self.lock_operating();
        match self.inner.status.get()? {
            Status::Initial => return Err(ProducerError::NotConfigured),
            Status::Closing | Status::Closed => return Err(ProducerError::Closed),
            Status::Connected => {
                if let Some(client) = self.current_client() {
                    return Ok(client);
                }
            }
            Status::Configured | Status::Disconnecting | Status::Disconnected => {}
        }

        let client = self.build_client()?;
        *self.lock_client() = Some(Arc::clone(&client));
        self.inner.pid.store(process::id(), Ordering::Release);
        if !self.inner.status.get()?.is_connected() {
            self.inner.status.set(Status::Connected);
        }
        self.touch();

        self.instrument(events::PRODUCER_CONNECTED, json!({}));
        info!(producer_id = %self.inner.id, "producer connected");
        Ok(client)
    }

    /// Builds a transport, initializes transactions and registers it for polling.
    fn build_client(&self) -> Result<Arc<dyn Transport>, ProducerError> {
        let config = self.config()?;
        let client: Arc<dyn Transport> = if config.deliver {
            config.transport.build(BuildContext {
                producer_id: self.inner.id.clone(),
                settings: config.settings.clone(),
                events: callbacks::event_sink(Arc::downgrade(&self.inner)),
            })?
        } else {
            Arc::new(NoopTransport::new())
        };

        if config.transactional_id().is_some() {
            if let Err(e) = client.init_transactions(config.max_wait_timeout) {
                client.close();
                return Err(e.into());
            }
        }
        if let Err(e) = self.poller().and_then(|poller| {
            poller
                .register(
                    &self.inner.id,
                    Arc::clone(&client),
                    Arc::clone(&self.inner.monitor),
                    &config.polling,
                )
                .map_err(ProducerError::from)
        }) {
            client.close();
            return Err(e);
        }
        Ok(client)
    }

    /// Replaces the transport after a fatal error.
    ///
    /// Skipped while closing; the closing thread owns the transport then.
    pub(crate) fn reload(&self, attempt: u32) -> Result<(), ProducerError> {
        let _operating = self.lock_operating();
        match self.inner.status.get()? {
            Status::Connected => {}
            Status::Initial => return Err(ProducerError::NotConfigured),
            // Nothing built yet or already torn down: the next use connects.
            Status::Configured | Status::Disconnecting | Status::Disconnected => return Ok(()),
            Status::Closing | Status::Closed => return Ok(()),
        }
        let config = self.config()?;

        let old = self.lock_client().take();
        if let Some(old) = old {
            if let Err(e) = old.flush(config.max_wait_timeout) {
                debug!(producer_id = %self.inner.id, error = %e, "flush before reload failed");
            }
            let dropped = std::mem::take(&mut *self.lock_buffer()).len();
            if let Err(e) = old.purge() {
                debug!(producer_id = %self.inner.id, error = %e, "purge before reload failed");
            }
            if dropped > 0 {
                warn!(producer_id = %self.inner.id, dropped, "buffered messages purged by reload");
            }
            self.poller()?.unregister(&self.inner.id);
            old.close();
        }

        let client = self.build_client()?;
        *self.lock_client() = Some(client);
        self.inner.pid.store(process::id(), Ordering::Release);

        warn!(producer_id = %self.inner.id, attempt, "transport reloaded after fatal error");
        self.instrument(events::PRODUCER_RELOADED, json!({ "attempt": attempt }));
        Ok(())
    }

    fn poller(&self) -> Result<Poller, ProducerError> {
        match &self.config()?.poller {
            Some(poller) => Ok(poller.clone()),
            None => Ok(Poller::global()?),
        }
    }

    fn check_fork(&self) -> Result<(), ProducerError> {
        let connected_pid = self.inner.pid.load(Ordering::Acquire);
        let current_pid = process::id();
        if connected_pid != 0 && connected_pid != current_pid {
            return Err(ProducerError::UsedInParentProcess {
                connected_pid,
                current_pid,
            });
        }
        Ok(())
    }

    fn is_closing_thread(&self) -> bool {
        self.inner.closing_thread.load() == Some(thread::current().id())
    }

    fn current_client(&self) -> Option<Arc<dyn Transport>> {
        self.lock_client().clone()
    }

    /// Records dispatch activity for idle disconnect.
    fn touch(&self) {
        self.inner.last_activity.store(Instant::now());
    }

    /// Emits `name` on this producer's monitor, tagged with the producer id.
    pub(crate) fn instrument(&self, name: &str, payload: Value) {
        let mut payload = match payload {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        payload.insert("producer_id".to_owned(), Value::String(self.inner.id.clone()));
        self.inner.monitor.instrument(name, Value::Object(payload));
    }

    fn lock_operating(&self) -> MutexGuard<'_, ()> {
        self.inner.operating.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_client(&self) -> MutexGuard<'_, Option<Arc<dyn Transport>>> {
        self.inner.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, Vec<Message>> {
        self.inner.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status.get().ok())
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}
