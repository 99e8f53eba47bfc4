//! Runs a few producers against in-memory transports on one shared poller.
//!
//! ```sh
//! RUST_LOG=spout=debug cargo run --bin demo
//! ```

use spout::{
    LoggerListener, MemoryTransportBuilder, MemoryTransportConfig, Message, Poller, PollerConfig, PollingConfig,
    Producer, ProducerConfig, ProducerError,
};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let poller = Poller::new(PollerConfig::default().with_poll_timeout(Duration::from_millis(250)))?;
    let transports = MemoryTransportBuilder::new(
        MemoryTransportConfig::default()
            .with_partitions(3)
            .with_ack_delay(Duration::from_millis(2))
            .with_statistics_interval(Duration::from_millis(500)),
    );
    let polling = PollingConfig::default()
        .with_max_poll_time(Duration::from_millis(20))
        .with_periodic_poll_interval(Duration::from_millis(200));

    let plain = Producer::with_config(
        ProducerConfig::new(transports.clone())
            .with_polling(polling)
            .with_poller(poller.clone()),
    )?;
    LoggerListener::attach(plain.monitor());

    let transactional = Producer::with_config(
        ProducerConfig::new(transports.clone())
            .with_transactional_id("demo-tx")
            .with_polling(polling)
            .with_poller(poller.clone()),
    )?;
    LoggerListener::attach(transactional.monitor());

    let started = Instant::now();
    let report = plain.produce_sync(Message::new("events", b"hello".to_vec()).with_key(b"k1".to_vec()))?;
    info!(partition = report.partition, offset = report.offset, "sync delivery");

    let handles = plain.produce_many_async(
        (0..100)
            .map(|i| Message::new("events", format!("event-{i}").into_bytes()))
            .collect(),
    )?;
    for handle in &handles {
        handle.wait(Duration::from_secs(5))?;
    }
    info!(count = handles.len(), elapsed = ?started.elapsed(), "async batch delivered");

    let committed = transactional.transaction(|| {
        transactional.produce_async(Message::new("orders", b"order-1".to_vec()))?;
        transactional.produce_async(Message::new("orders", b"order-2".to_vec()))?;
        Ok("committed")
    })?;
    info!(outcome = ?committed, "first transaction");

    let rolled_back = transactional.transaction(|| {
        transactional.produce_async(Message::new("orders", b"order-3".to_vec()))?;
        Err::<(), _>(ProducerError::AbortTransaction)
    })?;
    info!(outcome = ?rolled_back, "second transaction");

    // Let a couple of periodic polls and statistics go by.
    std::thread::sleep(Duration::from_millis(600));

    plain.close()?;
    transactional.close()?;
    poller.shutdown();
    info!(transports = transports.build_count(), "done");
    Ok(())
}
