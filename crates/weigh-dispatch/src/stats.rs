//! Per-sink delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of one sink's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    /// Events the sink accepted.
    pub delivered: u64,
    /// Rejected delivery attempts. Storage retries each one; the network
    /// sink does not.
    pub failed: u64,
    /// Events that never reached the sink: network queue overflow, or a
    /// storage write still failing at shutdown.
    pub dropped: u64,
    /// Times ingestion waited longer than the overload threshold.
    pub overloaded: u64,
}

/// Snapshot of both sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub storage: SinkStats,
    pub network: SinkStats,
}

#[derive(Debug, Default)]
pub(crate) struct SinkCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    overloaded: AtomicU64,
}

impl SinkCounters {
    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn overloaded(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SinkStats {
        SinkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) storage: SinkCounters,
    pub(crate) network: SinkCounters,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            storage: self.storage.snapshot(),
            network: self.network.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        counters.storage.delivered();
        counters.storage.delivered();
        counters.storage.overloaded();
        counters.network.dropped(7);
        counters.network.failed();

        let stats = counters.snapshot();
        assert_eq!(
            stats.storage,
            SinkStats {
                delivered: 2,
                overloaded: 1,
                ..SinkStats::default()
            }
        );
        assert_eq!(stats.network.dropped, 7);
        assert_eq!(stats.network.failed, 1);
    }
}
