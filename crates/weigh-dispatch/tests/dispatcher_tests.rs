//! Dispatcher behavior with slow, failing and healthy sinks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rstest::rstest;
use tokio::sync::mpsc;
use tokio::time::Instant;

use weigh_core::{Error, EventPayload, EventSink, ProtocolEvent, ProtocolOutput, Result};
use weigh_dispatch::{DISPATCHER_DEVICE, Dispatcher, DispatcherConfig, SinkStats};

#[derive(Clone, Default)]
struct Record {
    seen: Arc<Mutex<Vec<(ProtocolEvent, Instant)>>>,
    flushes: Arc<AtomicUsize>,
}

impl Record {
    /// Sequences of device events, leaving out dispatcher diagnostics.
    fn sequences(&self) -> Vec<u64> {
        self.seen
            .lock()
            .iter()
            .filter(|(event, _)| event.device != DISPATCHER_DEVICE)
            .map(|(event, _)| event.sequence)
            .collect()
    }

    fn overloads(&self) -> Vec<(String, u64)> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(event, _)| match &event.payload {
                EventPayload::SinkOverloaded { sink, waited_ms } => Some((sink.clone(), *waited_ms)),
                _ => None,
            })
            .collect()
    }
}

struct RecordingSink {
    name: &'static str,
    record: Record,
    delay: Duration,
    failures_left: u32,
}

impl RecordingSink {
    fn new(name: &'static str, record: &Record) -> Self {
        Self {
            name,
            record: record.clone(),
            delay: Duration::ZERO,
            failures_left: 0,
        }
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject the first `count` delivery attempts.
    fn fail_first(mut self, count: u32) -> Self {
        self.failures_left = count;
        self
    }
}

impl EventSink for RecordingSink {
    fn name(&self) -> &str {
        self.name
    }

    async fn deliver(&mut self, event: &ProtocolEvent) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(Error::sink(self.name, "rejected"));
        }
        self.record.seen.lock().push((event.clone(), Instant::now()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.record.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn event(sequence: u64) -> ProtocolEvent {
    ProtocolEvent::new(
        "balance-1",
        sequence,
        Utc::now(),
        ProtocolOutput::new(EventPayload::MassReading {
            grams: sequence as f64,
            raw: sequence as i64,
            stable: false,
        }),
    )
}

#[rstest]
#[case(1)]
#[case(8)]
#[case(64)]
#[tokio::test(start_paused = true)]
async fn test_network_flood_never_delays_storage(#[case] network_capacity: usize) {
    let storage = Record::default();
    let network = Record::default();
    let (tx, rx) = mpsc::channel(2048);
    let start = Instant::now();

    let dispatcher = Dispatcher::spawn(
        rx,
        RecordingSink::new("storage", &storage),
        RecordingSink::new("network", &network).delay(Duration::from_secs(1)),
        DispatcherConfig::default().network_capacity(network_capacity),
    );
    for sequence in 1..=1000 {
        tx.send(event(sequence)).await.unwrap();
    }
    drop(tx);
    let stats = dispatcher.join().await;

    assert_eq!(storage.sequences(), (1..=1000).collect::<Vec<u64>>());
    assert!(
        storage
            .seen
            .lock()
            .iter()
            .all(|(_, at)| at.duration_since(start) < Duration::from_secs(1)),
        "storage waited on the network sink"
    );
    assert_eq!(
        stats.storage,
        SinkStats {
            delivered: 1000,
            ..SinkStats::default()
        }
    );

    assert!(stats.network.dropped > 0);
    assert_eq!(stats.network.delivered + stats.network.dropped, 1000);
    let forwarded = network.sequences();
    assert!(forwarded.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(forwarded.last(), Some(&1000));
}

#[tokio::test(start_paused = true)]
async fn test_slow_storage_is_reported_but_loses_nothing() {
    let storage = Record::default();
    let network = Record::default();
    let (tx, rx) = mpsc::channel(16);

    let dispatcher = Dispatcher::spawn(
        rx,
        RecordingSink::new("storage", &storage).delay(Duration::from_secs(5)),
        RecordingSink::new("network", &network),
        DispatcherConfig::default()
            .storage_capacity(1)
            .storage_wait(Duration::from_secs(1)),
    );
    for sequence in 1..=4 {
        tx.send(event(sequence)).await.unwrap();
    }
    drop(tx);
    let stats = dispatcher.join().await;

    assert_eq!(storage.sequences(), vec![1, 2, 3, 4]);
    assert_eq!(stats.storage.delivered, 4);
    assert!(stats.storage.overloaded >= 1);
    assert_eq!(stats.storage.failed, 0);
    assert_eq!(stats.storage.dropped, 0);
    assert_eq!(network.sequences(), vec![1, 2, 3, 4]);

    let overloads = network.overloads();
    assert!(!overloads.is_empty(), "no overload event reached the network");
    assert_eq!(overloads.len() as u64, stats.storage.overloaded);
    assert!(
        overloads
            .iter()
            .all(|(sink, waited_ms)| sink == "storage" && *waited_ms >= 1000)
    );
    assert!(storage.overloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_storage_writes_are_retried_until_stored() {
    let storage = Record::default();
    let network = Record::default();
    let (tx, rx) = mpsc::channel(16);
    let start = Instant::now();

    let dispatcher = Dispatcher::spawn(
        rx,
        RecordingSink::new("storage", &storage).fail_first(3),
        RecordingSink::new("network", &network).fail_first(2),
        DispatcherConfig::default()
            .storage_retry(Duration::from_millis(100), Duration::from_secs(1)),
    );
    for sequence in 1..=6 {
        tx.send(event(sequence)).await.unwrap();
    }
    drop(tx);
    let stats = dispatcher.join().await;

    assert_eq!(storage.sequences(), (1..=6).collect::<Vec<u64>>());
    assert_eq!(stats.storage.delivered, 6);
    assert_eq!(stats.storage.failed, 3);
    assert_eq!(stats.storage.dropped, 0);
    assert!(storage.seen.lock()[0].1.duration_since(start) >= Duration::from_millis(100));
    assert_eq!(storage.flushes.load(Ordering::SeqCst), 1);

    // The network sink gives up on an event after one attempt.
    assert_eq!(network.sequences(), vec![3, 4, 5, 6]);
    assert_eq!(stats.network.delivered, 4);
    assert_eq!(stats.network.failed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_storage_retries() {
    let storage = Record::default();
    let network = Record::default();
    let (tx, rx) = mpsc::channel(16);

    let dispatcher = Dispatcher::spawn(
        rx,
        RecordingSink::new("storage", &storage).fail_first(u32::MAX),
        RecordingSink::new("network", &network),
        DispatcherConfig::default(),
    );
    for sequence in 1..=3 {
        tx.send(event(sequence)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(30)).await;

    let stats = dispatcher.shutdown().await;
    assert!(storage.sequences().is_empty());
    assert_eq!(stats.storage.delivered, 0);
    assert_eq!(stats.storage.dropped, 3);
    assert!(stats.storage.failed > 3, "storage was not retried");
    assert_eq!(network.sequences(), vec![1, 2, 3]);
    assert_eq!(storage.flushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_drains_queued_events() {
    let storage = Record::default();
    let network = Record::default();
    let (tx, rx) = mpsc::channel(64);

    let dispatcher = Dispatcher::spawn(
        rx,
        RecordingSink::new("storage", &storage),
        RecordingSink::new("network", &network),
        DispatcherConfig::default(),
    );
    for sequence in 1..=10 {
        tx.send(event(sequence)).await.unwrap();
    }

    // Producers are still alive; shutdown must not wait for them.
    let stats = dispatcher.shutdown().await;
    assert_eq!(stats.storage.delivered, 10);
    assert_eq!(storage.sequences(), (1..=10).collect::<Vec<u64>>());
    assert_eq!(storage.flushes.load(Ordering::SeqCst), 1);
    assert_eq!(network.flushes.load(Ordering::SeqCst), 1);
    assert!(tx.send(event(11)).await.is_err());
}
