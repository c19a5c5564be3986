//! Fan-out of coordinated events to the storage and network sinks.
//!
//! ```text
//!                          ┌─ mpsc (bounded, waits) ──────> storage task ──> S
//! coordinator ──> ingest ──┤
//!                          └─ broadcast (drops oldest) ───> network task ──> N
//! ```
//!
//! Each sink runs on its own task, so a slow network client never holds
//! up storage. Ingestion waits for room in the storage queue (no event is
//! ever discarded on the way to storage) and raises a `SinkOverloaded`
//! event every time a wait exceeds the configured threshold. A failed
//! storage write is retried with backoff until it succeeds, so a failing
//! database backs up into ingestion instead of losing events; only a
//! shutdown ends the retries. The network queue never blocks: on overflow
//! its oldest events are dropped and counted, and a failed network write
//! is not retried.
//!
//! `SinkOverloaded` events carry [`DISPATCHER_DEVICE`] as their device and
//! go to the network sink only; the storage queue they report on is full.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weigh_core::constants::{
    DEFAULT_NETWORK_QUEUE, DEFAULT_STORAGE_QUEUE, DEFAULT_STORAGE_RETRY_INITIAL,
    DEFAULT_STORAGE_RETRY_MAX, DEFAULT_STORAGE_WAIT,
};
use weigh_core::{Backoff, Error, EventPayload, EventSink, ProtocolEvent, ProtocolOutput};

use crate::stats::{Counters, DispatcherStats, SinkCounters};

/// Device name stamped on events the dispatcher raises itself.
pub const DISPATCHER_DEVICE: &str = "dispatcher";

/// Queue sizes, the storage overload threshold and storage retry timing.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub storage_capacity: usize,
    pub network_capacity: usize,
    /// Wait on a full storage queue before raising `SinkOverloaded`.
    pub storage_wait: Duration,
    pub storage_retry_initial: Duration,
    pub storage_retry_max: Duration,
}

impl DispatcherConfig {
    pub fn storage_capacity(mut self, capacity: usize) -> Self {
        self.storage_capacity = capacity;
        self
    }

    pub fn network_capacity(mut self, capacity: usize) -> Self {
        self.network_capacity = capacity;
        self
    }

    pub fn storage_wait(mut self, wait: Duration) -> Self {
        self.storage_wait = wait;
        self
    }

    pub fn storage_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.storage_retry_initial = initial;
        self.storage_retry_max = max;
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            storage_capacity: DEFAULT_STORAGE_QUEUE,
            network_capacity: DEFAULT_NETWORK_QUEUE,
            storage_wait: DEFAULT_STORAGE_WAIT,
            storage_retry_initial: DEFAULT_STORAGE_RETRY_INITIAL,
            storage_retry_max: DEFAULT_STORAGE_RETRY_MAX,
        }
    }
}

/// Handle to the running dispatch tasks.
#[derive(Debug)]
pub struct Dispatcher {
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    ingest: JoinHandle<()>,
    storage: JoinHandle<()>,
    network: JoinHandle<()>,
}

impl Dispatcher {
    /// Start delivering `events` to both sinks.
    ///
    /// Runs until every sender of `events` is dropped or
    /// [`shutdown`](Self::shutdown) is called.
    pub fn spawn<S, N>(
        events: mpsc::Receiver<ProtocolEvent>,
        storage: S,
        network: N,
        config: DispatcherConfig,
    ) -> Self
    where
        S: EventSink,
        N: EventSink,
    {
        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();

        let (storage_tx, storage_rx) = mpsc::channel(config.storage_capacity.max(1));
        let (network_tx, network_rx) = broadcast::channel(config.network_capacity.max(1));

        info!(
            storage = storage.name(),
            network = network.name(),
            storage_capacity = config.storage_capacity,
            network_capacity = config.network_capacity,
            "Starting event dispatcher"
        );

        let ingest = Ingest {
            storage_name: storage.name().to_string(),
            storage_tx,
            network_tx,
            storage_wait: config.storage_wait,
            counters: counters.clone(),
            diagnostics: AtomicU64::new(0),
        };

        let storage = tokio::spawn(run_storage(
            SinkWorker::new(storage),
            storage_rx,
            counters.clone(),
            Backoff::new(config.storage_retry_initial, config.storage_retry_max),
            shutdown.clone(),
        ));
        let network = tokio::spawn(run_network(
            SinkWorker::new(network),
            network_rx,
            counters.clone(),
        ));
        let ingest = tokio::spawn(ingest.run(events, shutdown.clone()));

        Self {
            counters,
            shutdown,
            ingest,
            storage,
            network,
        }
    }

    /// Current counters.
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// Wait for the upstream channel to close and both sinks to drain.
    pub async fn join(self) -> DispatcherStats {
        for (task, handle) in [
            ("ingest", self.ingest),
            ("storage", self.storage),
            ("network", self.network),
        ] {
            if let Err(e) = handle.await {
                error!(task, "Dispatcher task failed: {}", e);
            }
        }
        let stats = self.counters.snapshot();
        info!(?stats, "Event dispatcher stopped");
        stats
    }

    /// Stop taking new events, deliver everything already queued, flush
    /// both sinks and return the final counters.
    ///
    /// Storage writes that fail from here on are not retried; those events
    /// are counted as dropped.
    pub async fn shutdown(self) -> DispatcherStats {
        self.shutdown.cancel();
        self.join().await
    }
}

struct Ingest {
    storage_name: String,
    storage_tx: mpsc::Sender<ProtocolEvent>,
    network_tx: broadcast::Sender<ProtocolEvent>,
    storage_wait: Duration,
    counters: Arc<Counters>,
    /// Sequence of the last event raised by the dispatcher itself.
    diagnostics: AtomicU64,
}

impl Ingest {
    async fn run(self, mut events: mpsc::Receiver<ProtocolEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.forward(event).await;
        }

        // Events already queued upstream are still delivered.
        events.close();
        while let Some(event) = events.recv().await {
            self.forward(event).await;
        }
        debug!("Ingestion finished");
    }

    async fn forward(&self, event: ProtocolEvent) {
        if self.network_tx.send(event.clone()).is_err() {
            self.counters.network.dropped(1);
        }

        let device = event.device.clone();
        let sequence = event.sequence;
        let started = Instant::now();
        let send = self.storage_tx.send(event);
        tokio::pin!(send);

        loop {
            match tokio::time::timeout(self.storage_wait, &mut send).await {
                Ok(Ok(())) => return,
                Ok(Err(_)) => {
                    self.counters.storage.dropped(1);
                    error!(%device, sequence, "Storage task gone; event not stored");
                    return;
                }
                Err(_) => {
                    self.counters.storage.overloaded();
                    let waited_ms = started.elapsed().as_millis() as u64;
                    let overloaded = Error::SinkOverloaded {
                        sink: self.storage_name.clone(),
                        waited_ms,
                    };
                    warn!(%device, sequence, "{}", overloaded);
                    self.raise(EventPayload::SinkOverloaded {
                        sink: self.storage_name.clone(),
                        waited_ms,
                    });
                }
            }
        }
    }

    /// Publish a dispatcher event on the network queue.
    fn raise(&self, payload: EventPayload) {
        let sequence = self.diagnostics.fetch_add(1, Ordering::Relaxed) + 1;
        let event = ProtocolEvent::new(
            DISPATCHER_DEVICE,
            sequence,
            Utc::now(),
            ProtocolOutput::new(payload),
        );
        if self.network_tx.send(event).is_err() {
            self.counters.network.dropped(1);
        }
    }
}

/// A sink plus its failure streak, so a dead sink logs once, not per event.
struct SinkWorker<S> {
    sink: S,
    failing: bool,
}

impl<S: EventSink> SinkWorker<S> {
    fn new(sink: S) -> Self {
        Self {
            sink,
            failing: false,
        }
    }

    /// One delivery attempt. Returns whether the sink accepted the event.
    async fn deliver(&mut self, event: &ProtocolEvent, counters: &SinkCounters) -> bool {
        match self.sink.deliver(event).await {
            Ok(()) => {
                counters.delivered();
                if self.failing {
                    info!(sink = self.sink.name(), "Sink recovered");
                    self.failing = false;
                }
                true
            }
            Err(e) => {
                counters.failed();
                if self.failing {
                    debug!(sink = self.sink.name(), device = %event.device, sequence = event.sequence, "Delivery failed: {}", e);
                } else {
                    warn!(sink = self.sink.name(), device = %event.device, sequence = event.sequence, "Delivery failed: {}", e);
                    self.failing = true;
                }
                false
            }
        }
    }

    /// Deliver `event`, retrying with `backoff` until the sink accepts it.
    /// Once `shutdown` is cancelled a failed attempt is final.
    async fn deliver_until_stored(
        &mut self,
        event: &ProtocolEvent,
        counters: &SinkCounters,
        backoff: &mut Backoff,
        shutdown: &CancellationToken,
    ) {
        loop {
            if self.deliver(event, counters).await {
                backoff.reset();
                return;
            }
            if !shutdown.is_cancelled() {
                let delay = backoff.next_delay();
                debug!(
                    sink = self.sink.name(),
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying delivery"
                );
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => continue,
                }
                // Shutdown interrupted the wait: one last attempt.
                if self.deliver(event, counters).await {
                    backoff.reset();
                    return;
                }
            }
            counters.dropped(1);
            error!(
                sink = self.sink.name(),
                device = %event.device,
                sequence = event.sequence,
                "Event not stored: sink still failing at shutdown"
            );
            return;
        }
    }

    async fn finish(&mut self) {
        if let Err(e) = self.sink.flush().await {
            warn!(sink = self.sink.name(), "Flush failed: {}", e);
        }
        debug!(sink = self.sink.name(), "Sink drained");
    }
}

async fn run_storage<S: EventSink>(
    mut worker: SinkWorker<S>,
    mut queue: mpsc::Receiver<ProtocolEvent>,
    counters: Arc<Counters>,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) {
    while let Some(event) = queue.recv().await {
        worker
            .deliver_until_stored(&event, &counters.storage, &mut backoff, &shutdown)
            .await;
    }
    worker.finish().await;
}

async fn run_network<N: EventSink>(
    mut worker: SinkWorker<N>,
    mut queue: broadcast::Receiver<ProtocolEvent>,
    counters: Arc<Counters>,
) {
    loop {
        match queue.recv().await {
            Ok(event) => {
                worker.deliver(&event, &counters.network).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                counters.network.dropped(skipped);
                warn!(
                    sink = worker.sink.name(),
                    dropped = skipped,
                    "Sink queue overflowed; oldest events dropped"
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
    worker.finish().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = DispatcherConfig::default()
            .storage_capacity(8)
            .network_capacity(4)
            .storage_wait(Duration::from_millis(100))
            .storage_retry(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(config.storage_capacity, 8);
        assert_eq!(config.network_capacity, 4);
        assert_eq!(config.storage_wait, Duration::from_millis(100));
        assert_eq!(config.storage_retry_initial, Duration::from_millis(10));
        assert_eq!(config.storage_retry_max, Duration::from_secs(1));
    }

    #[test]
    fn test_default_network_queue_is_bounded() {
        let config = DispatcherConfig::default();
        assert!(config.network_capacity > 0);
        assert!(config.storage_capacity >= config.network_capacity);
    }
}
