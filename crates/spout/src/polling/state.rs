use super::SignalPipe;
use crate::backoff::Backoff;
use crate::config::PollingConfig;
use crate::instrumentation::Monitor;
use crate::latch::ReadinessLatch;
use crate::transport::{Transport, TransportError};
use crossbeam_utils::atomic::AtomicCell;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on how long a staleness answer is reused.
const MAX_STALE_CHECK_THROTTLE: Duration = Duration::from_millis(100);

/// Everything the poller keeps about one registered producer.
///
/// Only the poller thread polls the transport through this record and only
/// the poller thread tears it down. Producers touch it through
/// [`signal_close`](Self::signal_close) and [`wait_closed`](Self::wait_closed).
pub(crate) struct ClientPollState {
    id: String,
    transport: Arc<dyn Transport>,
    monitor: Arc<Monitor>,
    pipe: SignalPipe,
    max_poll_time: Duration,
    periodic_poll_interval: Duration,
    stale_check_throttle: Duration,
    last_poll: AtomicCell<Instant>,
    last_stale_check: AtomicCell<Instant>,
    last_stale_result: AtomicBool,
    closing: AtomicBool,
    closed: ReadinessLatch,
}

impl ClientPollState {
    /// Creates the record and points the transport's queue events at its pipe.
    pub(crate) fn new(
        id: &str,
        transport: Arc<dyn Transport>,
        monitor: Arc<Monitor>,
        polling: &PollingConfig,
    ) -> io::Result<Self> {
        let pipe = SignalPipe::new()?;
        transport.enable_queue_io_events(pipe.write_fd());
        let now = Instant::now();

        Ok(Self {
            id: id.to_owned(),
            transport,
            monitor,
            pipe,
            max_poll_time: polling.max_poll_time,
            periodic_poll_interval: polling.periodic_poll_interval,
            stale_check_throttle: (polling.periodic_poll_interval / 10).min(MAX_STALE_CHECK_THROTTLE),
            last_poll: AtomicCell::new(now),
            last_stale_check: AtomicCell::new(now),
            last_stale_result: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: ReadinessLatch::new(),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.pipe.read_fd()
    }

    /// Asks the poller to come back to this client on its next iteration.
    pub(crate) fn signal_continue(&self) {
        self.pipe.signal();
    }

    /// Marks the client for teardown and wakes the poller.
    pub(crate) fn signal_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.pipe.signal();
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Teardown finished: pipe closed and waiters released.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_released()
    }

    pub(crate) fn drain_signals(&self) -> usize {
        self.pipe.drain()
    }

    /// One time-boxed drain. Re-signals itself when the budget ran out first.
    ///
    /// A failed poll still counts as a poll, so a broken transport waits for
    /// its next periodic deadline like any other client.
    pub(crate) fn poll(&self) -> Result<bool, TransportError> {
        let drained = self.transport.poll_drain_nonblocking(self.max_poll_time);
        self.mark_polled(Instant::now());
        let hit_limit = drained?;
        if hit_limit {
            self.signal_continue();
        }
        Ok(hit_limit)
    }

    /// Polls until the transport reports nothing pending.
    pub(crate) fn poll_until_empty(&self) -> Result<(), TransportError> {
        self.drain_with(&mut Backoff::new(Duration::from_millis(1)))
    }

    fn drain_with(&self, backoff: &mut Backoff) -> Result<(), TransportError> {
        let mut pending = usize::MAX;
        loop {
            let drained = self.transport.poll_drain_nonblocking(self.max_poll_time);
            self.mark_polled(Instant::now());
            drained?;

            let remaining = self.transport.queue_size();
            if remaining == 0 {
                return Ok(());
            }
            if remaining < pending {
                backoff.reset();
            }
            pending = remaining;
            backoff.wait();
        }
    }

    /// Whether the client went unpolled for a full periodic interval.
    ///
    /// The answer is cached for a fraction of the interval so busy iterations
    /// do not recompute it for every client.
    pub(crate) fn needs_periodic_poll(&self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_stale_check.load()) < self.stale_check_throttle {
            return self.last_stale_result.load(Ordering::Relaxed);
        }
        self.last_stale_check.store(now);
        let stale = now.saturating_duration_since(self.last_poll.load()) >= self.periodic_poll_interval;
        self.last_stale_result.store(stale, Ordering::Relaxed);
        stale
    }

    /// When this client next becomes due for a periodic poll.
    pub(crate) fn next_periodic_deadline(&self) -> Instant {
        self.last_poll.load() + self.periodic_poll_interval
    }

    /// Stops queue notifications, closes the pipe and releases waiters.
    pub(crate) fn close(&self) {
        self.transport.disable_queue_io_events();
        self.pipe.close();
        self.closed.release();
    }

    /// Blocks until [`close`](Self::close) ran.
    pub(crate) fn wait_closed(&self) {
        self.closed.wait();
    }

    pub(crate) fn mark_polled(&self, now: Instant) {
        self.last_poll.store(now);
        self.last_stale_result.store(false, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ClientPollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPollState")
            .field("id", &self.id)
            .field("pipe", &self.pipe)
            .field("closing", &self.is_closing())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ErrorCode, MemoryTransport, MemoryTransportConfig, Operation, Settings};
    use std::thread;

    fn state(config: MemoryTransportConfig, polling: PollingConfig) -> (ClientPollState, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new(config, &Settings::new(), Arc::new(|_| {})));
        let state = ClientPollState::new("p-1", transport.clone(), Arc::new(Monitor::new()), &polling).unwrap();
        (state, transport)
    }

    #[test]
    fn test_transport_writes_to_pipe() {
        let (state, transport) = state(MemoryTransportConfig::default(), PollingConfig::default());
        assert_eq!(transport.io_fd(), Some(state.pipe.write_fd()));

        transport.enqueue_synthetic(2);
        assert_eq!(state.drain_signals(), 1);
    }

    #[test]
    fn test_poll_resignals_when_budget_exhausted() {
        let (state, transport) = state(
            MemoryTransportConfig::default().with_event_cost(Duration::from_millis(2)),
            PollingConfig::default().with_max_poll_time(Duration::from_millis(5)),
        );
        transport.enqueue_synthetic(20);
        state.drain_signals();

        assert!(state.poll().unwrap());
        assert!(state.drain_signals() > 0);

        state.poll_until_empty().unwrap();
        assert_eq!(transport.queue_size(), 0);
    }

    #[test]
    fn test_failed_poll_still_counts() {
        let (state, transport) = state(
            MemoryTransportConfig::default(),
            PollingConfig::default().with_periodic_poll_interval(Duration::from_millis(50)),
        );
        transport.fail_always(Operation::Poll, TransportError::new(ErrorCode::Transport, "down"));
        let before = state.next_periodic_deadline();
        thread::sleep(Duration::from_millis(5));

        assert!(state.poll().is_err());
        assert!(state.next_periodic_deadline() > before);
        assert!(!state.needs_periodic_poll(Instant::now()));
    }

    #[test]
    fn test_drain_backs_off_only_without_progress() {
        let (state, transport) = state(
            MemoryTransportConfig::default().with_event_cost(Duration::from_millis(1)),
            PollingConfig::default().with_max_poll_time(Duration::from_millis(1)),
        );
        transport.enqueue_synthetic(30);
        state.drain_signals();

        let mut backoff = Backoff::new(Duration::from_millis(1));
        state.drain_with(&mut backoff).unwrap();
        assert_eq!(transport.queue_size(), 0);
        // Every round served an event, so the wait never escalated
        assert!(!backoff.is_parking());
    }

    #[test]
    fn test_staleness_follows_interval() {
        let (state, _) = state(
            MemoryTransportConfig::default(),
            PollingConfig::default().with_periodic_poll_interval(Duration::from_millis(50)),
        );
        let start = Instant::now();
        assert!(!state.needs_periodic_poll(start));
        assert!(state.needs_periodic_poll(start + Duration::from_millis(60)));

        state.mark_polled(start + Duration::from_millis(60));
        assert!(!state.needs_periodic_poll(start + Duration::from_millis(61)));
        assert_eq!(state.next_periodic_deadline(), start + Duration::from_millis(110));
    }

    #[test]
    fn test_close_releases_waiters() {
        let (state, transport) = state(MemoryTransportConfig::default(), PollingConfig::default());
        state.signal_close();
        assert!(state.is_closing());
        assert!(!state.is_closed());

        state.close();
        state.wait_closed();
        assert!(state.is_closed());
        assert_eq!(transport.io_fd(), None);
    }
}
