//! Interfaces to the collaborators outside the session manager.

#![allow(async_fn_in_trait)]

use std::collections::HashMap;
use std::future::Future;

use parking_lot::RwLock;

use crate::error::Result;
use crate::event::ProtocolEvent;
use crate::types::CalibrationState;

/// A downstream consumer of coordinated events (storage, network).
///
/// Sinks are driven by a single dispatcher task, so they take `&mut self`
/// and need not be `Sync`.
pub trait EventSink: Send + 'static {
    /// Name used in logs and counters.
    fn name(&self) -> &str;

    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// A failed delivery is counted and logged by the dispatcher; it is
    /// never retried and never propagated upstream.
    fn deliver(&mut self, event: &ProtocolEvent) -> impl Future<Output = Result<()>> + Send;

    /// Flush buffered output. Called once when the dispatcher drains.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// An optional sink; `None` accepts and discards every event.
impl<S: EventSink> EventSink for Option<S> {
    fn name(&self) -> &str {
        match self {
            Some(sink) => sink.name(),
            None => "disabled",
        }
    }

    async fn deliver(&mut self, event: &ProtocolEvent) -> Result<()> {
        match self {
            Some(sink) => sink.deliver(event).await,
            None => Ok(()),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Some(sink) => sink.flush().await,
            None => Ok(()),
        }
    }
}

/// Per-balance calibration persistence.
///
/// Loaded when a session starts and saved on every change, so calibration
/// survives reconnection and session replacement.
pub trait CalibrationStore: Send + Sync {
    fn load(&self, device: &str) -> Option<CalibrationState>;

    fn save(&self, device: &str, calibration: CalibrationState);
}

/// In-process [`CalibrationStore`].
#[derive(Debug, Default)]
pub struct MemoryCalibrationStore {
    entries: RwLock<HashMap<String, CalibrationState>>,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with calibrations recovered from durable storage.
    pub fn with_entries(entries: impl IntoIterator<Item = (String, CalibrationState)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn load(&self, device: &str) -> Option<CalibrationState> {
        self.entries.read().get(device).copied()
    }

    fn save(&self, device: &str, calibration: CalibrationState) {
        self.entries.write().insert(device.to_string(), calibration);
    }
}
