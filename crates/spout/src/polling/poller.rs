//! The shared poller thread.

use super::signal_pipe::{is_ready, pollfd, wait_readable};
use super::{ClientPollState, SignalPipe};
use crate::config::{PollerConfig, PollingConfig};
use crate::error::PollerError;
use crate::instrumentation::{events, Monitor};
use crate::invariants::{debug_assert_on_poller_thread, debug_assert_unregistered};
use crate::latch::ReadinessLatch;
use crate::transport::Transport;
use serde_json::json;
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static GLOBAL: OnceLock<Poller> = OnceLock::new();

thread_local! {
    /// Identity of the poller whose loop runs on this thread.
    static CURRENT_POLLER: Cell<usize> = const { Cell::new(0) };
}

/// Multiplexes many producers' transports onto one background thread.
///
/// The thread waits on every registered client's [`SignalPipe`] plus its own
/// wakeup pipe, polls whichever client signalled, and polls idle clients at
/// least once per periodic interval. It starts with the first registration,
/// retires once the last client is gone and restarts on the next one.
///
/// `Poller` is a cheap handle; clones drive the same thread. Most code uses
/// [`Poller::global`]; independent instances come from [`Poller::new`].
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

struct Registry {
    clients: HashMap<String, Arc<ClientPollState>>,
    running: bool,
}

struct Worker {
    handle: JoinHandle<()>,
    exited: Arc<ReadinessLatch>,
}

struct PollerInner {
    config: PollerConfig,
    wakeup: SignalPipe,
    registry: Mutex<Registry>,
    /// Registry changed since the readiness list was last built.
    dirty: AtomicBool,
    shutdown: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

/// Poller-thread-local view of the registry used for the readiness wait.
///
/// Entry 0 of `fds` is the wakeup pipe; entry `i + 1` belongs to `states[i]`.
#[derive(Default)]
struct ReadinessList {
    fds: Vec<libc::pollfd>,
    states: Vec<Arc<ClientPollState>>,
}

enum Step {
    Continue,
    Retire,
}

impl Poller {
    /// Creates an independent poller. No thread runs until the first registration.
    pub fn new(config: PollerConfig) -> Result<Self, PollerError> {
        Ok(Self {
            inner: Arc::new(PollerInner {
                config,
                wakeup: SignalPipe::new()?,
                registry: Mutex::new(Registry {
                    clients: HashMap::new(),
                    running: false,
                }),
                dirty: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        })
    }

    /// The process-wide poller, created with default configuration on first use.
    pub fn global() -> Result<Self, PollerError> {
        if let Some(poller) = GLOBAL.get() {
            return Ok(poller.clone());
        }
        let poller = Self::new(PollerConfig::default())?;
        Ok(GLOBAL.get_or_init(|| poller).clone())
    }

    pub fn config(&self) -> &PollerConfig {
        &self.inner.config
    }

    /// Starts polling `transport` on behalf of producer `id`.
    ///
    /// Starts the background thread when needed and wakes it so the new client
    /// is part of the very next readiness wait.
    pub fn register(
        &self,
        id: &str,
        transport: Arc<dyn Transport>,
        monitor: Arc<Monitor>,
        polling: &PollingConfig,
    ) -> Result<(), PollerError> {
        {
            let mut registry = self.inner.lock_registry();
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Err(PollerError::ShutDown);
            }
            if registry.clients.contains_key(id) {
                return Err(PollerError::AlreadyRegistered(id.to_owned()));
            }

            let state = ClientPollState::new(id, transport, Arc::clone(&monitor), polling)?;
            registry.clients.insert(id.to_owned(), Arc::new(state));
            self.inner.dirty.store(true, Ordering::Release);

            if !registry.running {
                if let Err(e) = self.spawn() {
                    if let Some(state) = registry.clients.remove(id) {
                        state.close();
                    }
                    return Err(e);
                }
                registry.running = true;
            }
        }

        self.inner.wakeup.signal();
        debug!(producer_id = id, "producer registered with poller");
        monitor.instrument(events::POLLER_PRODUCER_REGISTERED, json!({ "producer_id": id }));
        Ok(())
    }

    /// Stops polling producer `id`, blocking until its client is fully drained
    /// and torn down. Returns immediately for unknown ids.
    ///
    /// On the poller thread itself (from inside a callback) the teardown runs
    /// inline since the thread cannot wait for itself.
    pub fn unregister(&self, id: &str) {
        let Some(state) = self.inner.lock_registry().clients.get(id).cloned() else {
            return;
        };

        if self.is_current_thread() {
            self.inner.handle_close(&state);
        } else {
            state.signal_close();
            state.wait_closed();
        }

        debug!(producer_id = id, "producer unregistered from poller");
        state
            .monitor()
            .instrument(events::POLLER_PRODUCER_UNREGISTERED, json!({ "producer_id": id }));
    }

    /// Stops the thread after tearing every client down. Idempotent.
    ///
    /// Waits at most `shutdown_timeout` for the thread; registrations fail
    /// with [`PollerError::ShutDown`] afterwards.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let states: Vec<_> = self.inner.lock_registry().clients.values().cloned().collect();
        for state in &states {
            state.signal_close();
        }
        self.inner.wakeup.signal();

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        if self.is_current_thread() {
            // The loop notices the flag once the current callback returns.
            return;
        }
        if worker.exited.wait_timeout(self.inner.config.shutdown_timeout) {
            if worker.handle.join().is_err() {
                warn!("poller thread panicked during shutdown");
            }
            info!(clients = states.len(), "poller shut down");
        } else {
            warn!(
                timeout = ?self.inner.config.shutdown_timeout,
                "poller thread did not exit in time, detaching"
            );
        }
    }

    pub fn registered_count(&self) -> usize {
        self.inner.lock_registry().clients.len()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.lock_registry().clients.contains_key(id)
    }

    /// Whether the background thread is alive.
    pub fn is_running(&self) -> bool {
        self.inner.lock_registry().running
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Whether the caller is this poller's background thread.
    pub fn is_current_thread(&self) -> bool {
        CURRENT_POLLER.with(|current| current.get() == self.inner.key())
    }

    // Called with the registry lock held.
    fn spawn(&self) -> Result<(), PollerError> {
        let inner = Arc::clone(&self.inner);
        let exited = Arc::new(ReadinessLatch::new());
        let signal_exit = Arc::clone(&exited);

        let handle = thread::Builder::new()
            .name(self.inner.config.thread_name.clone())
            .spawn(move || {
                let _exit = ExitGuard(signal_exit);
                inner.run();
            })?;

        // A retired thread's handle is simply dropped; it has already left its loop.
        *self.inner.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Worker { handle, exited });
        Ok(())
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("config", &self.inner.config)
            .field("registered", &self.registered_count())
            .field("running", &self.is_running())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Releases the exit latch even if the loop unwinds.
struct ExitGuard(Arc<ReadinessLatch>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl PollerInner {
    fn key(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        CURRENT_POLLER.with(|current| current.set(self.key()));
        apply_thread_priority(self.config.thread_priority);
        info!(thread = %self.config.thread_name, "poller thread started");

        let mut list = ReadinessList::default();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.teardown_all();
                break;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| self.iterate(&mut list))) {
                Ok(Ok(Step::Continue)) => {}
                Ok(Ok(Step::Retire)) => break,
                Ok(Err(e)) => self.report_loop_error(&e.to_string()),
                Err(payload) => self.report_loop_error(&panic_message(payload.as_ref())),
            }
        }

        CURRENT_POLLER.with(|current| current.set(0));
        info!(thread = %self.config.thread_name, "poller thread exited");
    }

    fn iterate(&self, list: &mut ReadinessList) -> Result<Step, PollerError> {
        self.refresh(list);

        if list.states.is_empty() {
            wait_readable(&mut list.fds, self.config.poll_timeout)?;
            self.wakeup.drain();
            self.refresh(list);
            if list.states.is_empty() {
                let mut registry = self.lock_registry();
                if registry.clients.is_empty() && !self.shutdown.load(Ordering::Acquire) {
                    registry.running = false;
                    debug!("no producers left, poller thread retiring");
                    return Ok(Step::Retire);
                }
            }
            return Ok(Step::Continue);
        }

        let timeout = self.wait_timeout(list);
        let ready = wait_readable(&mut list.fds, timeout)?;

        if ready == 0 {
            for state in &list.states {
                self.service(state);
            }
        } else {
            if is_ready(&list.fds[0]) {
                self.wakeup.drain();
            }
            for (entry, state) in list.fds[1..].iter().zip(&list.states) {
                if !is_ready(entry) || state.is_closed() {
                    continue;
                }
                if !state.is_closing() {
                    state.drain_signals();
                }
                // A close signalled during the drain lost its byte; `service` still sees the flag.
                self.service(state);
            }
        }

        self.poll_stale(list);
        Ok(Step::Continue)
    }

    /// Tears a closing client down, otherwise polls it once.
    fn service(&self, state: &Arc<ClientPollState>) {
        if state.is_closed() {
            return;
        }
        if state.is_closing() {
            self.handle_close(state);
        } else {
            self.poll_client(state);
        }
    }

    /// One time-boxed poll. A failure is reported and confined to this client.
    fn poll_client(&self, state: &ClientPollState) {
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| state.poll())) {
            Ok(Ok(_)) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => {
                state.mark_polled(Instant::now());
                panic_message(payload.as_ref())
            }
        };
        debug!(producer_id = state.id(), error = %failure, "client poll failed");
        self.report_loop_error(&failure);
    }

    /// Rebuilds the readiness list if the registry changed.
    fn refresh(&self, list: &mut ReadinessList) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let registry = self.lock_registry();
        list.states.clear();
        list.states.extend(registry.clients.values().cloned());
        list.fds.clear();
        list.fds.push(pollfd(self.wakeup.read_fd()));
        list.fds.extend(list.states.iter().map(|s| pollfd(s.read_fd())));
    }

    /// Smaller of `poll_timeout` and the time until the next periodic poll is due.
    fn wait_timeout(&self, list: &ReadinessList) -> Duration {
        let now = Instant::now();
        list.states
            .iter()
            .filter(|s| !s.is_closing())
            .map(|s| s.next_periodic_deadline())
            .min()
            .map_or(self.config.poll_timeout, |deadline| {
                deadline.saturating_duration_since(now).min(self.config.poll_timeout)
            })
    }

    /// Tears down clients still marked closing and polls those that went a
    /// full periodic interval without being polled.
    fn poll_stale(&self, list: &ReadinessList) {
        let now = Instant::now();
        for state in &list.states {
            if state.is_closing() || state.needs_periodic_poll(now) {
                self.service(state);
            }
        }
    }

    /// Drains a closing client completely, then removes and closes it.
    fn handle_close(&self, state: &Arc<ClientPollState>) {
        debug_assert_on_poller_thread!(
            CURRENT_POLLER.with(|current| current.get() == self.key()),
            state.id()
        );
        if state.is_closed() {
            return;
        }
        state.drain_signals();

        let drained = panic::catch_unwind(AssertUnwindSafe(|| state.poll_until_empty()));
        let failure = match drained {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(error) = failure {
            warn!(producer_id = state.id(), %error, "final drain before teardown failed");
            state.monitor().instrument(
                events::ERROR_OCCURRED,
                json!({
                    "type": "poller.close_drain",
                    "producer_id": state.id(),
                    "error": error,
                }),
            );
        }

        let still_registered = {
            let mut registry = self.lock_registry();
            if registry
                .clients
                .get(state.id())
                .is_some_and(|current| Arc::ptr_eq(current, state))
            {
                registry.clients.remove(state.id());
                self.dirty.store(true, Ordering::Release);
            }
            registry
                .clients
                .get(state.id())
                .is_some_and(|current| Arc::ptr_eq(current, state))
        };
        debug_assert_unregistered!(still_registered, state.id());

        state.close();
        debug!(producer_id = state.id(), "client torn down");
    }

    fn teardown_all(&self) {
        let states: Vec<_> = self.lock_registry().clients.values().cloned().collect();
        for state in &states {
            self.handle_close(state);
        }
        self.lock_registry().running = false;
    }

    /// Reports a loop failure to every distinct registered monitor.
    fn report_loop_error(&self, error: &str) {
        error!(error = %error, "poller loop iteration failed");
        self.dirty.store(true, Ordering::Release);

        let states: Vec<_> = self.lock_registry().clients.values().cloned().collect();
        let mut notified: Vec<*const Monitor> = Vec::new();
        for state in &states {
            let key = Arc::as_ptr(state.monitor());
            if notified.contains(&key) {
                continue;
            }
            notified.push(key);
            state.monitor().instrument(
                events::ERROR_OCCURRED,
                json!({
                    "type": "poller.polling_loop",
                    "producer_id": state.id(),
                    "error": error,
                }),
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "poller loop panicked".to_owned()
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn apply_thread_priority(priority: i32) {
    if priority == 0 {
        return;
    }
    // SAFETY: plain syscalls on the calling thread.
    let rc = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, priority)
    };
    if rc != 0 {
        warn!(priority, error = %std::io::Error::last_os_error(), "could not set poller thread priority");
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn apply_thread_priority(priority: i32) {
    if priority != 0 {
        debug!(priority, "poller thread priority is not supported on this platform");
    }
}
