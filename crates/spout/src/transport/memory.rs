//! Synthetic in-process transport.
//!
//! Behaves like a native client from the producer's and the poller's point of
//! view: `produce` enqueues a delivery report and writes a byte to the queue
//! event descriptor, reports are only served while the transport is polled,
//! `abort_transaction` and `purge` turn in-flight messages into purge
//! failures. Adds knobs a real broker does not have: acknowledgement delay,
//! per-event processing cost, synthetic events and error injection.

use super::{
    BuildContext, DeliveryHandle, DeliveryReport, ErrorCode, EventSink, Message, Settings,
    Transport, TransportBuilder, TransportError, TransportEvent,
};
use crate::config::TRANSACTIONAL_ID;
use crate::Backoff;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Transport calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Produce,
    Poll,
    Flush,
    InitTransactions,
    BeginTransaction,
    CommitTransaction,
    AbortTransaction,
}

/// Behavior knobs of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryTransportConfig {
    /// Partitions per topic.
    ///
    /// Default: 1
    pub partitions: i32,

    /// Maximum queued events before `produce` fails with `queue_full`.
    ///
    /// Default: 100_000
    pub queue_capacity: usize,

    /// How long after `produce` a delivery report becomes servable.
    ///
    /// Default: zero
    pub ack_delay: Duration,

    /// Time spent serving each event, to simulate a busy client.
    ///
    /// Default: zero
    pub event_cost: Duration,

    /// Emit statistics at most this often, and only while being polled.
    ///
    /// Default: disabled
    pub statistics_interval: Option<Duration>,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            queue_capacity: 100_000,
            ack_delay: Duration::ZERO,
            event_cost: Duration::ZERO,
            statistics_interval: None,
        }
    }
}

impl MemoryTransportConfig {
    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    pub fn with_event_cost(mut self, cost: Duration) -> Self {
        self.event_cost = cost;
        self
    }

    pub fn with_statistics_interval(mut self, interval: Duration) -> Self {
        self.statistics_interval = Some(interval);
        self
    }
}

/// Counters exposed for assertions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub produced: u64,
    pub delivered: u64,
    pub purged: u64,
    pub synthetic: u64,
    pub polls: u64,
    pub statistics: u64,
    pub inits: u64,
    pub begins: u64,
    pub commits: u64,
    pub aborts: u64,
}

enum Queued {
    Delivery {
        handle: DeliveryHandle,
        result: Result<DeliveryReport, TransportError>,
        ready_at: Instant,
    },
    Synthetic,
}

impl Queued {
    fn is_ready(&self, now: Instant) -> bool {
        match self {
            Self::Delivery { ready_at, .. } => *ready_at <= now,
            Self::Synthetic => true,
        }
    }
}

struct Failure {
    operation: Operation,
    error: TransportError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

struct State {
    queue: VecDeque<Queued>,
    next_offsets: HashMap<(String, i32), i64>,
    round_robin: i32,
    transactions_initialized: bool,
    in_transaction: bool,
    failures: Vec<Failure>,
    last_statistics: Instant,
    stats: MemoryStats,
}

/// In-process transport. See the module docs.
pub struct MemoryTransport {
    config: MemoryTransportConfig,
    transactional: bool,
    events: EventSink,
    state: Mutex<State>,
    io_fd: RwLock<Option<RawFd>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(config: MemoryTransportConfig, settings: &Settings, events: EventSink) -> Self {
        Self {
            config,
            transactional: settings.get(TRANSACTIONAL_ID).is_some_and(|id| !id.is_empty()),
            events,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                next_offsets: HashMap::new(),
                round_robin: 0,
                transactions_initialized: false,
                in_transaction: false,
                failures: Vec::new(),
                last_statistics: Instant::now(),
                stats: MemoryStats::default(),
            }),
            io_fd: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Fails the next `times` calls of `operation` with `error`.
    pub fn fail_next(&self, operation: Operation, error: TransportError, times: usize) {
        self.lock().failures.push(Failure {
            operation,
            error,
            remaining: Some(times),
        });
    }

    /// Fails every call of `operation` with `error`.
    pub fn fail_always(&self, operation: Operation, error: TransportError) {
        self.lock().failures.push(Failure {
            operation,
            error,
            remaining: None,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Enqueues `count` events that carry no message, each costing `event_cost` to serve.
    pub fn enqueue_synthetic(&self, count: usize) {
        {
            let mut state = self.lock();
            state.queue.extend((0..count).map(|_| Queued::Synthetic));
        }
        self.notify_io();
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Descriptor currently receiving queue events.
    pub fn io_fd(&self) -> Option<RawFd> {
        *self.io_fd.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::new(ErrorCode::State, "transport is closed"));
        }
        Ok(())
    }

    fn take_failure(&self, operation: Operation) -> Result<(), TransportError> {
        let mut state = self.lock();
        let Some(idx) = state.failures.iter().position(|f| f.operation == operation) else {
            return Ok(());
        };
        let failure = &mut state.failures[idx];
        let error = failure.error.clone();
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.failures.remove(idx);
            }
        }
        Err(error)
    }

    fn notify_io(&self) {
        // Read lock held across the write so `disable_queue_io_events` waits it out.
        let fd = self.io_fd.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(fd) = *fd {
            let byte = 1u8;
            // SAFETY: writing one byte from a valid stack location; the descriptor
            // stays open while the read lock is held.
            unsafe {
                libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
            }
        }
    }

    fn pick_partition(&self, state: &mut State, message: &Message) -> i32 {
        let partitions = self.config.partitions.max(1);
        match &message.key {
            Some(key) => {
                let hash = key
                    .iter()
                    .fold(2166136261u32, |h, b| (h ^ u32::from(*b)).wrapping_mul(16777619));
                (hash % partitions as u32) as i32
            }
            None => {
                state.round_robin = (state.round_robin + 1) % partitions;
                state.round_robin
            }
        }
    }

    /// Turns every undelivered message into a purge failure servable right away.
    fn purge_queued(state: &mut State) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        state.queue.retain(|q| !matches!(q, Queued::Synthetic));
        for queued in &mut state.queue {
            if let Queued::Delivery { result, ready_at, .. } = queued {
                if result.is_ok() {
                    *result = Err(TransportError::purged());
                    purged += 1;
                }
                *ready_at = now;
            }
        }
        purged
    }

    fn maybe_emit_statistics(&self, now: Instant) {
        let Some(interval) = self.config.statistics_interval else {
            return;
        };
        let snapshot = {
            let mut state = self.lock();
            if now.duration_since(state.last_statistics) < interval {
                return;
            }
            state.last_statistics = now;
            state.stats.statistics += 1;
            json!({
                "txmsgs": state.stats.produced,
                "msg_cnt": state.queue.len(),
                "polls": state.stats.polls,
            })
        };
        (self.events)(TransportEvent::Statistics(snapshot));
    }

    /// Serves ready events without consulting injected poll failures.
    fn drain(&self, max_time: Duration) -> bool {
        let started = Instant::now();
        self.lock().stats.polls += 1;
        self.maybe_emit_statistics(started);

        loop {
            let next = {
                let mut state = self.lock();
                match state.queue.front() {
                    Some(front) if front.is_ready(Instant::now()) => state.queue.pop_front(),
                    _ => None,
                }
            };
            let Some(event) = next else {
                return false;
            };
            self.serve(event);

            if started.elapsed() >= max_time {
                let now = Instant::now();
                return self.lock().queue.front().is_some_and(|q| q.is_ready(now));
            }
        }
    }

    fn serve(&self, event: Queued) {
        if !self.config.event_cost.is_zero() {
            thread::sleep(self.config.event_cost);
        }
        match event {
            Queued::Delivery { handle, result, .. } => {
                {
                    let mut state = self.lock();
                    if result.is_ok() {
                        state.stats.delivered += 1;
                    } else {
                        state.stats.purged += 1;
                    }
                }
                // Report first so listeners have seen it by the time a waiter wakes.
                (self.events)(TransportEvent::Delivery {
                    topic: handle.topic().to_owned(),
                    label: handle.label().map(str::to_owned),
                    result: result.clone(),
                });
                handle.resolve(result);
            }
            Queued::Synthetic => {
                self.lock().stats.synthetic += 1;
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn produce(&self, message: &Message, _topic_settings: &Settings) -> Result<DeliveryHandle, TransportError> {
        self.ensure_open()?;
        self.take_failure(Operation::Produce)?;

        let handle = {
            let mut state = self.lock();
            if state.queue.len() >= self.config.queue_capacity {
                return Err(TransportError::queue_full());
            }
            if self.transactional && !state.in_transaction {
                return Err(TransportError::new(
                    ErrorCode::State,
                    "transactional producer must produce inside a transaction",
                ));
            }

            let partition = match message.partition {
                Some(p) => p,
                None => self.pick_partition(&mut state, message),
            };
            let offset = {
                let next = state
                    .next_offsets
                    .entry((message.topic.clone(), partition))
                    .or_insert(0);
                let offset = *next;
                *next += 1;
                offset
            };

            let handle = DeliveryHandle::new(message.topic.clone(), message.label.clone());
            state.queue.push_back(Queued::Delivery {
                handle: handle.clone(),
                result: Ok(DeliveryReport {
                    topic: message.topic.clone(),
                    partition,
                    offset,
                    label: message.label.clone(),
                }),
                ready_at: Instant::now() + self.config.ack_delay,
            });
            state.stats.produced += 1;
            handle
        };

        self.notify_io();
        Ok(handle)
    }

    fn poll_drain_nonblocking(&self, max_time: Duration) -> Result<bool, TransportError> {
        self.take_failure(Operation::Poll)?;
        Ok(self.drain(max_time))
    }

    fn queue_size(&self) -> usize {
        self.lock().queue.len()
    }

    fn enable_queue_io_events(&self, fd: RawFd) {
        *self.io_fd.write().unwrap_or_else(PoisonError::into_inner) = Some(fd);
        if self.queue_size() > 0 {
            self.notify_io();
        }
    }

    fn disable_queue_io_events(&self) {
        *self.io_fd.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        self.take_failure(Operation::Flush)?;
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(Duration::from_millis(1));
        let mut pending = usize::MAX;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.drain(remaining);
            let queued = self.queue_size();
            if queued == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::retryable(ErrorCode::TimedOut, "flush timed out"));
            }
            if queued < pending {
                backoff.reset();
            }
            pending = queued;
            backoff.wait();
        }
    }

    fn purge(&self) -> Result<(), TransportError> {
        let purged = Self::purge_queued(&mut self.lock());
        if purged > 0 {
            self.notify_io();
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Nobody polls a closed transport: fail what is left so no waiter hangs.
        let leftovers: Vec<_> = self.lock().queue.drain(..).collect();
        for queued in leftovers {
            if let Queued::Delivery { handle, .. } = queued {
                handle.resolve(Err(TransportError::purged()));
            }
        }
    }

    fn init_transactions(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.take_failure(Operation::InitTransactions)?;
        if !self.transactional {
            return Err(TransportError::fatal(ErrorCode::State, "no transactional.id configured"));
        }
        let mut state = self.lock();
        state.transactions_initialized = true;
        state.stats.inits += 1;
        Ok(())
    }

    fn begin_transaction(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.take_failure(Operation::BeginTransaction)?;
        let mut state = self.lock();
        if !state.transactions_initialized {
            return Err(TransportError::new(ErrorCode::State, "transactions not initialized"));
        }
        if state.in_transaction {
            return Err(TransportError::new(
                ErrorCode::InvalidTransactionState,
                "transaction already in progress",
            ));
        }
        state.in_transaction = true;
        state.stats.begins += 1;
        Ok(())
    }

    fn commit_transaction(&self, timeout: Duration) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.take_failure(Operation::CommitTransaction)?;
        if !self.is_in_transaction() {
            return Err(TransportError::new(ErrorCode::InvalidTransactionState, "no transaction in progress"));
        }
        self.flush(timeout)?;
        let mut state = self.lock();
        state.in_transaction = false;
        state.stats.commits += 1;
        Ok(())
    }

    fn abort_transaction(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.take_failure(Operation::AbortTransaction)?;
        let purged = {
            let mut state = self.lock();
            if !state.in_transaction {
                return Err(TransportError::new(ErrorCode::InvalidTransactionState, "no transaction in progress"));
            }
            state.in_transaction = false;
            state.stats.aborts += 1;
            Self::purge_queued(&mut state)
        };
        if purged > 0 {
            self.notify_io();
        }
        Ok(())
    }
}

struct BuilderShared {
    config: MemoryTransportConfig,
    failures: Mutex<Vec<(Operation, TransportError)>>,
    built: Mutex<Vec<Arc<MemoryTransport>>>,
}

/// Builds [`MemoryTransport`]s and keeps a reference to each for inspection.
///
/// Cloning shares the same build history.
#[derive(Clone)]
pub struct MemoryTransportBuilder {
    shared: Arc<BuilderShared>,
}

impl MemoryTransportBuilder {
    pub fn new(config: MemoryTransportConfig) -> Self {
        Self {
            shared: Arc::new(BuilderShared {
                config,
                failures: Mutex::new(Vec::new()),
                built: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every transport built from now on fails `operation` forever.
    pub fn with_failure(self, operation: Operation, error: TransportError) -> Self {
        self.shared
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((operation, error));
        self
    }

    pub fn build_count(&self) -> usize {
        self.shared.built.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The most recently built transport.
    pub fn last(&self) -> Option<Arc<MemoryTransport>> {
        self.shared
            .built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Default for MemoryTransportBuilder {
    fn default() -> Self {
        Self::new(MemoryTransportConfig::default())
    }
}

impl TransportBuilder for MemoryTransportBuilder {
    fn build(&self, ctx: BuildContext) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = Arc::new(MemoryTransport::new(
            self.shared.config.clone(),
            &ctx.settings,
            ctx.events,
        ));
        for (operation, error) in self
            .shared
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            transport.fail_always(*operation, error.clone());
        }
        self.shared
            .built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&transport));
        Ok(transport)
    }
}
