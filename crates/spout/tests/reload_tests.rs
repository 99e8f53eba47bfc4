//! Integration tests for transport reloads on idempotent producers and for
//! idle disconnect with transparent reconnect.

use spout::{
    events, ErrorCode, MemoryTransportBuilder, MemoryTransportConfig, Message, Monitor, Operation, Poller,
    PollerConfig, PollingConfig, Producer, ProducerConfig, Status, TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn poller() -> Poller {
    Poller::new(PollerConfig::default().with_poll_timeout(Duration::from_millis(50))).unwrap()
}

fn counter(monitor: &Monitor, event: &str) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    monitor
        .subscribe(event, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    count
}

fn message() -> Message {
    Message::new("events", b"payload".to_vec())
}

// =============================================================================
// Idempotent reload
// =============================================================================

#[test]
fn test_persistent_fatal_error_reloads_up_to_cap() {
    let poller = poller();
    let builder = MemoryTransportBuilder::default()
        .with_failure(Operation::Produce, TransportError::fatal(ErrorCode::Fatal, "broker lost pid"));
    let producer = Producer::with_config(
        ProducerConfig::new(builder.clone())
            .with_idempotence()
            .with_idempotent_reload(Duration::from_millis(1), 3)
            .with_poller(poller.clone()),
    )
    .unwrap();
    let reloads = counter(producer.monitor(), events::PRODUCER_RELOADED);

    let err = producer.produce_sync(message()).unwrap_err();

    assert_eq!(err.code(), Some(ErrorCode::Fatal));
    assert_eq!(reloads.load(Ordering::SeqCst), 3);
    assert_eq!(builder.build_count(), 4);
    assert_eq!(poller.registered_count(), 1);

    // The budget is per call
    assert!(producer.produce_async(message()).is_err());
    assert_eq!(reloads.load(Ordering::SeqCst), 6);

    producer.close().unwrap();
    poller.shutdown();
}

#[test]
fn test_transient_fatal_error_recovered_by_reload() {
    let poller = poller();
    let builder = MemoryTransportBuilder::default();
    let producer = Producer::with_config(
        ProducerConfig::new(builder.clone())
            .with_idempotence()
            .with_idempotent_reload(Duration::from_millis(1), 3)
            .with_poller(poller.clone()),
    )
    .unwrap();
    let reloads = counter(producer.monitor(), events::PRODUCER_RELOADED);

    producer.produce_sync(message()).unwrap();
    let first = builder.last().unwrap();
    first.fail_next(Operation::Produce, TransportError::fatal(ErrorCode::Fatal, "broker lost pid"), 1);

    let report = producer.produce_sync(message()).unwrap();

    assert_eq!(report.offset, 0);
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
    assert!(first.is_closed());
    assert_eq!(builder.last().unwrap().stats().delivered, 1);

    producer.close().unwrap();
    poller.shutdown();
}

#[test]
fn test_fenced_error_never_reloads() {
    let poller = poller();
    let builder = MemoryTransportBuilder::default()
        .with_failure(Operation::Produce, TransportError::fatal(ErrorCode::Fenced, "fenced"));
    let producer = Producer::with_config(
        ProducerConfig::new(builder.clone())
            .with_idempotence()
            .with_idempotent_reload(Duration::from_millis(1), 3)
            .with_poller(poller.clone()),
    )
    .unwrap();
    let reloads = counter(producer.monitor(), events::PRODUCER_RELOADED);

    let err = producer.produce_sync(message()).unwrap_err();

    assert_eq!(err.code(), Some(ErrorCode::Fenced));
    assert_eq!(reloads.load(Ordering::SeqCst), 0);
    assert_eq!(builder.build_count(), 1);

    producer.close().unwrap();
    poller.shutdown();
}

#[test]
fn test_non_idempotent_producer_never_reloads() {
    let poller = poller();
    let builder = MemoryTransportBuilder::default()
        .with_failure(Operation::Produce, TransportError::fatal(ErrorCode::Fatal, "broker lost pid"));
    let producer = Producer::with_config(
        ProducerConfig::new(builder.clone())
            .with_idempotent_reload(Duration::from_millis(1), 3)
            .with_poller(poller.clone()),
    )
    .unwrap();

    assert!(producer.produce_sync(message()).is_err());
    assert_eq!(builder.build_count(), 1);

    producer.close().unwrap();
    poller.shutdown();
}

#[test]
fn test_retryable_error_surfaces_without_reload() {
    let poller = poller();
    let builder = MemoryTransportBuilder::default()
        .with_failure(Operation::Produce, TransportError::retryable(ErrorCode::Transport, "broker down"));
    let producer = Producer::with_config(
        ProducerConfig::new(builder.clone())
            .with_idempotence()
            .with_idempotent_reload(Duration::from_millis(1), 3)
            .with_poller(poller.clone()),
    )
    .unwrap();

    let err = producer.produce_sync(message()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Transport));
    assert_eq!(builder.build_count(), 1);

    producer.close().unwrap();
    poller.shutdown();
}

// =============================================================================
// Idle disconnect
// =============================================================================

#[test]
fn test_idle_producer_disconnects_and_reconnects() {
    let poller = poller();
    let builder = MemoryTransportBuilder::new(
        MemoryTransportConfig::default().with_statistics_interval(Duration::from_millis(20)),
    );
    let producer = Producer::with_config(
        ProducerConfig::new(builder.clone())
            .with_idle_disconnect_timeout(Duration::from_millis(100))
            .with_polling(PollingConfig::default().with_periodic_poll_interval(Duration::from_millis(20)))
            .with_poller(poller.clone()),
    )
    .unwrap();
    let connected = counter(producer.monitor(), events::PRODUCER_CONNECTED);
    let disconnected = counter(producer.monitor(), events::PRODUCER_DISCONNECTED);

    producer.produce_sync(message()).unwrap();
    assert_eq!(producer.status().unwrap(), Status::Connected);

    let deadline = Instant::now() + Duration::from_secs(2);
    while producer.status().unwrap() != Status::Disconnected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(producer.status().unwrap(), Status::Disconnected);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert!(!poller.is_registered(producer.id()));
    assert!(builder.last().unwrap().is_closed());

    producer.produce_sync(message()).unwrap();
    assert_eq!(producer.status().unwrap(), Status::Connected);
    assert_eq!(connected.load(Ordering::SeqCst), 2);
    assert_eq!(builder.build_count(), 2);

    producer.close().unwrap();
    poller.shutdown();
}

#[test]
fn test_busy_producer_stays_connected() {
    let poller = poller();
    let producer = Producer::with_config(
        ProducerConfig::new(MemoryTransportBuilder::new(
            MemoryTransportConfig::default().with_statistics_interval(Duration::from_millis(10)),
        ))
        .with_idle_disconnect_timeout(Duration::from_secs(5))
        .with_polling(PollingConfig::default().with_periodic_poll_interval(Duration::from_millis(10)))
        .with_poller(poller.clone()),
    )
    .unwrap();

    for _ in 0..10 {
        producer.produce_sync(message()).unwrap();
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(producer.status().unwrap(), Status::Connected);

    producer.close().unwrap();
    poller.shutdown();
}
