//! Multi-device coordinator.
//!
//! The coordinator owns one supervisor per configured device and merges
//! their events into a single stream. It holds no device state of its own:
//! it only routes commands by device name and fans events in.
//!
//! ```text
//! ┌──────────┐
//! │ rfid-1   │──────►┌─────────────────┐
//! │ session  │       │                 │
//! └──────────┘       │  Event Channel  │──────► EventStream
//! ┌──────────┐       │  (mpsc)         │
//! │ balance-1│──────►│                 │
//! │ session  │       └─────────────────┘
//! └──────────┘
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use weigh_core::{DeviceConfig, MemoryCalibrationStore, ReaderCommand};
//! use weigh_hardware::manager::{CoordinatorConfig, DeviceCoordinator};
//! use weigh_hardware::serial::SerialConnector;
//!
//! #[tokio::main]
//! async fn main() -> weigh_core::Result<()> {
//!     let (mut coordinator, mut events) = DeviceCoordinator::new(
//!         SerialConnector::new(),
//!         Arc::new(MemoryCalibrationStore::new()),
//!         CoordinatorConfig::default(),
//!     );
//!
//!     coordinator
//!         .configure(vec![DeviceConfig::reader("rfid-1", "/dev/ttyUSB0")])
//!         .await?;
//!     coordinator.start_all();
//!     coordinator.send_command("rfid-1", ReaderCommand::Start.into())?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{}", event);
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use weigh_core::{CalibrationStore, CommandRequest, DeviceConfig, Error, ProtocolEvent, Result};

use crate::devices::AnyConnector;
use crate::session::{
    DEFAULT_COMMAND_CAPACITY, EventStamper, SessionContext, SessionHandle, SessionStatus,
    check_kind,
};

/// Default depth of the merged event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Channel sizing for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Merged event channel depth. A full channel makes sessions wait.
    pub event_capacity: usize,
    /// Per-session command queue depth.
    pub command_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

/// Receiving end of the merged event stream.
///
/// Ends once the coordinator and all of its sessions are gone.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<ProtocolEvent>,
}

impl EventStream {
    /// Receive the next event from any device.
    pub async fn recv(&mut self) -> Option<ProtocolEvent> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<ProtocolEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_inner(self) -> mpsc::Receiver<ProtocolEvent> {
        self.rx
    }
}

/// Outcome of [`DeviceCoordinator::configure`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Coordinates one session per configured device.
pub struct DeviceCoordinator {
    connector: AnyConnector,
    calibrations: Arc<dyn CalibrationStore>,
    config: CoordinatorConfig,
    events: mpsc::Sender<ProtocolEvent>,
    devices: BTreeMap<String, DeviceConfig>,
    sessions: HashMap<String, SessionHandle>,
    /// Kept across session replacement so sequence numbers keep rising.
    stampers: HashMap<String, Arc<Mutex<EventStamper>>>,
    running: bool,
}

impl DeviceCoordinator {
    pub fn new(
        connector: impl Into<AnyConnector>,
        calibrations: Arc<dyn CalibrationStore>,
        config: CoordinatorConfig,
    ) -> (Self, EventStream) {
        let (events, rx) = mpsc::channel(config.event_capacity.max(1));
        let coordinator = Self {
            connector: connector.into(),
            calibrations,
            config,
            events,
            devices: BTreeMap::new(),
            sessions: HashMap::new(),
            stampers: HashMap::new(),
            running: false,
        };
        (coordinator, EventStream { rx })
    }

    /// Apply a full configuration snapshot.
    ///
    /// Devices missing from `configs` are stopped, devices whose config
    /// changed are stopped and then restarted, new devices are started. A
    /// replaced session has fully stopped before its successor opens the
    /// port. Sessions only start once [`start_all`](Self::start_all) has
    /// been called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid config or a duplicate name;
    /// nothing is changed in that case.
    pub async fn configure(&mut self, configs: Vec<DeviceConfig>) -> Result<ConfigureReport> {
        let mut desired = BTreeMap::new();
        for config in configs {
            config.validate()?;
            if desired.contains_key(&config.name) {
                return Err(Error::Config(format!("duplicate device name {}", config.name)));
            }
            desired.insert(config.name.clone(), config);
        }
        let mut ports = HashSet::new();
        for config in desired.values() {
            if !ports.insert(config.serial.port.as_str()) {
                return Err(Error::Config(format!(
                    "{}: port {} is used by another device",
                    config.name, config.serial.port
                )));
            }
        }

        let mut report = ConfigureReport::default();
        for (name, current) in &self.devices {
            match desired.get(name) {
                None => report.removed.push(name.clone()),
                Some(next) if next != current => report.changed.push(name.clone()),
                Some(_) => report.unchanged.push(name.clone()),
            }
        }
        report.added = desired
            .keys()
            .filter(|name| !self.devices.contains_key(*name))
            .cloned()
            .collect();

        let mut retiring: Vec<SessionHandle> = report
            .removed
            .iter()
            .chain(&report.changed)
            .filter_map(|name| self.sessions.remove(name))
            .collect();
        join_all(retiring.iter_mut().map(|session| session.stop())).await;

        self.devices = desired;
        if self.running {
            for name in report.added.iter().chain(&report.changed) {
                self.spawn_session(name);
            }
        }

        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            changed = report.changed.len(),
            unchanged = report.unchanged.len(),
            "Applied device configuration"
        );
        Ok(report)
    }

    /// Start a session for every configured device that has none.
    pub fn start_all(&mut self) {
        self.running = true;
        let idle: Vec<String> = self
            .devices
            .keys()
            .filter(|name| !self.sessions.contains_key(*name))
            .cloned()
            .collect();
        for name in &idle {
            self.spawn_session(name);
        }
        info!(sessions = self.sessions.len(), "Started device sessions");
    }

    /// Stop every session and wait for all of them to release their ports.
    pub async fn stop_all(&mut self) {
        self.running = false;
        let mut sessions: Vec<SessionHandle> = self.sessions.drain().map(|(_, s)| s).collect();
        join_all(sessions.iter_mut().map(|session| session.stop())).await;
        info!(sessions = sessions.len(), "Stopped device sessions");
    }

    /// Queue a command for `device`. Never waits for device I/O.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownDevice`] if no such device is configured
    /// - [`Error::CommandRejected`] for the wrong device kind or a full queue
    /// - [`Error::SessionStopped`] if the device is configured but not running
    pub fn send_command(&self, device: &str, request: CommandRequest) -> Result<()> {
        let config = self
            .devices
            .get(device)
            .ok_or_else(|| Error::UnknownDevice(device.to_string()))?;
        check_kind(config, &request)?;
        let session = self
            .sessions
            .get(device)
            .ok_or_else(|| Error::SessionStopped(device.to_string()))?;
        session.send_command(request)
    }

    /// Status of every configured device.
    pub fn statuses(&self) -> BTreeMap<String, SessionStatus> {
        self.devices
            .keys()
            .map(|name| {
                let status = self
                    .sessions
                    .get(name)
                    .map(|session| session.status())
                    .unwrap_or_default();
                (name.clone(), status)
            })
            .collect()
    }

    pub fn status(&self, device: &str) -> Option<SessionStatus> {
        self.devices.get(device)?;
        Some(
            self.sessions
                .get(device)
                .map(|session| session.status())
                .unwrap_or_default(),
        )
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.values()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn spawn_session(&mut self, name: &str) {
        let Some(config) = self.devices.get(name) else {
            return;
        };
        let stamper = self
            .stampers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(EventStamper::new())))
            .clone();
        let ctx = SessionContext::new(
            config.clone(),
            self.connector.clone(),
            self.events.clone(),
            self.calibrations.clone(),
        )
        .with_stamper(stamper);

        debug!(device = %name, serial = %config.serial, "Spawning session");
        let handle = SessionHandle::spawn(ctx, self.config.command_capacity);
        self.sessions.insert(name.to_string(), handle);
    }
}

impl std::fmt::Debug for DeviceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCoordinator")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("sessions", &self.sessions.len())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use weigh_core::{BalanceCommand, MemoryCalibrationStore, ReaderCommand, SessionState};

    fn coordinator() -> (DeviceCoordinator, EventStream) {
        DeviceCoordinator::new(
            MockConnector::new(),
            Arc::new(MemoryCalibrationStore::new()),
            CoordinatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_configure_reports_diff() {
        let (mut coordinator, _events) = coordinator();

        let report = coordinator
            .configure(vec![
                DeviceConfig::reader("rfid-1", "/dev/ttyUSB0"),
                DeviceConfig::balance("balance-1", "/dev/ttyUSB1"),
            ])
            .await
            .unwrap();
        assert_eq!(report.added, vec!["balance-1", "rfid-1"]);

        let report = coordinator
            .configure(vec![
                DeviceConfig::reader("rfid-1", "/dev/ttyUSB2"),
                DeviceConfig::reader("rfid-2", "/dev/ttyUSB3"),
            ])
            .await
            .unwrap();
        assert_eq!(report.added, vec!["rfid-2"]);
        assert_eq!(report.removed, vec!["balance-1"]);
        assert_eq!(report.changed, vec!["rfid-1"]);
        assert!(report.unchanged.is_empty());
    }

    #[tokio::test]
    async fn test_configure_rejects_duplicates() {
        let (mut coordinator, _events) = coordinator();

        let error = coordinator
            .configure(vec![
                DeviceConfig::reader("rfid-1", "/dev/ttyUSB0"),
                DeviceConfig::reader("rfid-1", "/dev/ttyUSB1"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Config(_)));

        let error = coordinator
            .configure(vec![
                DeviceConfig::reader("rfid-1", "/dev/ttyUSB0"),
                DeviceConfig::balance("balance-1", "/dev/ttyUSB0"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Config(_)));
        assert_eq!(coordinator.devices().count(), 0);
    }

    #[tokio::test]
    async fn test_command_routing_errors() {
        let (mut coordinator, _events) = coordinator();
        coordinator
            .configure(vec![DeviceConfig::reader("rfid-1", "/dev/ttyUSB0")])
            .await
            .unwrap();

        assert!(matches!(
            coordinator.send_command("rfid-9", ReaderCommand::Start.into()),
            Err(Error::UnknownDevice(_))
        ));
        assert!(matches!(
            coordinator.send_command("rfid-1", BalanceCommand::Tare.into()),
            Err(Error::CommandRejected { .. })
        ));
        assert!(matches!(
            coordinator.send_command("rfid-1", ReaderCommand::Start.into()),
            Err(Error::SessionStopped(_))
        ));
    }

    #[tokio::test]
    async fn test_statuses_cover_idle_devices() {
        let (mut coordinator, _events) = coordinator();
        coordinator
            .configure(vec![DeviceConfig::reader("rfid-1", "/dev/ttyUSB0")])
            .await
            .unwrap();

        let statuses = coordinator.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["rfid-1"].state, SessionState::Disconnected);
        assert_eq!(coordinator.status("rfid-9"), None);
    }
}
