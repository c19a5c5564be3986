//! TOML configuration file.
//!
//! ```toml
//! [database]
//! path = "data/weigh.db"
//!
//! [network]
//! address = "127.0.0.1:3233"
//! prefix = "weigh:"
//!
//! [[device]]
//! name = "rfid-1"
//! kind = "reader"
//! port = "/dev/ttyUSB0"
//!
//! [[device]]
//! name = "balance-1"
//! kind = "balance"
//! port = "/dev/ttyUSB1"
//! balance = { read_continuously = true, stability_tolerance = 2.5, measurement_rate_hz = 6 }
//! ```
//!
//! Every field except the device name, kind and port has a default; serial
//! line settings default to the ones the device kind requires.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use weigh_core::constants::{
    DEFAULT_NETWORK_QUEUE, DEFAULT_STORAGE_QUEUE, DEFAULT_STORAGE_RETRY_INITIAL,
    DEFAULT_STORAGE_RETRY_MAX, DEFAULT_STORAGE_WAIT,
};
use weigh_core::{
    BalanceSettings, CalibrationState, DeviceConfig, DeviceKind, FlowControl, Parity,
    SerialSettings, SessionTimeouts,
};
use weigh_dispatch::DispatcherConfig;
use weigh_hardware::CoordinatorConfig;
use weigh_network::TcpSinkConfig;
use weigh_storage::DatabaseConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    /// Absent: events are stored but not forwarded.
    #[serde(default)]
    pub network: Option<NetworkSection>,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceSection>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.devices.iter().map(DeviceSection::to_device_config).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseSection {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: "weigh.db".to_string(),
            max_connections: 4,
        }
    }
}

impl DatabaseSection {
    pub fn to_database_config(&self, path_override: Option<&str>) -> DatabaseConfig {
        DatabaseConfig::new(path_override.unwrap_or(&self.path))
            .max_connections(self.max_connections)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    pub address: SocketAddr,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub backoff_initial_ms: Option<u64>,
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
}

impl NetworkSection {
    pub fn to_sink_config(&self) -> TcpSinkConfig {
        let mut config = TcpSinkConfig::new(self.address);
        if let Some(prefix) = &self.prefix {
            config = config.prefix(prefix.clone());
        }
        if let Some(ms) = self.timeout_ms {
            config = config.timeout(Duration::from_millis(ms));
        }
        let initial = self
            .backoff_initial_ms
            .map_or(config.backoff_initial, Duration::from_millis);
        let max = self
            .backoff_max_ms
            .map_or(config.backoff_max, Duration::from_millis);
        config.backoff(initial, max)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DispatchSection {
    pub storage_queue: usize,
    pub network_queue: usize,
    pub storage_wait_ms: u64,
    pub storage_retry_initial_ms: u64,
    pub storage_retry_max_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            storage_queue: DEFAULT_STORAGE_QUEUE,
            network_queue: DEFAULT_NETWORK_QUEUE,
            storage_wait_ms: DEFAULT_STORAGE_WAIT.as_millis() as u64,
            storage_retry_initial_ms: DEFAULT_STORAGE_RETRY_INITIAL.as_millis() as u64,
            storage_retry_max_ms: DEFAULT_STORAGE_RETRY_MAX.as_millis() as u64,
        }
    }
}

impl DispatchSection {
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .storage_capacity(self.storage_queue)
            .network_capacity(self.network_queue)
            .storage_wait(Duration::from_millis(self.storage_wait_ms))
            .storage_retry(
                Duration::from_millis(self.storage_retry_initial_ms),
                Duration::from_millis(self.storage_retry_max_ms),
            )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoordinatorSection {
    pub event_capacity: usize,
    pub command_capacity: usize,
    /// Seconds between status log lines; 0 disables them.
    pub status_interval_secs: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            event_capacity: defaults.event_capacity,
            command_capacity: defaults.command_capacity,
            status_interval_secs: 60,
        }
    }
}

impl CoordinatorSection {
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            event_capacity: self.event_capacity,
            command_capacity: self.command_capacity,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    pub name: String,
    pub kind: DeviceKind,
    pub port: String,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub data_bits: Option<u8>,
    #[serde(default)]
    pub stop_bits: Option<u8>,
    #[serde(default)]
    pub parity: Option<Parity>,
    #[serde(default)]
    pub flow_control: Option<FlowControl>,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub balance: BalanceSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimeoutSection {
    pub liveness_ms: Option<u64>,
    pub partial_frame_ms: Option<u64>,
    pub response_ms: Option<u64>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BalanceSection {
    pub zero_offset: Option<i64>,
    pub gain: Option<f64>,
    pub readings_per_request: Option<u32>,
    pub stability_window: Option<usize>,
    pub stability_tolerance: Option<f64>,
    pub min_mass: Option<f64>,
    pub measurement_rate_hz: Option<u32>,
    pub read_continuously: Option<bool>,
}

impl DeviceSection {
    pub fn to_device_config(&self) -> DeviceConfig {
        let defaults = SerialSettings::for_kind(self.kind, self.port.clone());
        let serial = SerialSettings {
            baud_rate: self.baud_rate.unwrap_or(defaults.baud_rate),
            data_bits: self.data_bits.unwrap_or(defaults.data_bits),
            stop_bits: self.stop_bits.unwrap_or(defaults.stop_bits),
            parity: self.parity.unwrap_or(defaults.parity),
            flow_control: self.flow_control.unwrap_or(defaults.flow_control),
            ..defaults
        };

        let ms = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);
        let base = SessionTimeouts::default();
        let timeouts = SessionTimeouts {
            liveness: ms(self.timeouts.liveness_ms, base.liveness),
            partial_frame: ms(self.timeouts.partial_frame_ms, base.partial_frame),
            response: ms(self.timeouts.response_ms, base.response),
            backoff_initial: ms(self.timeouts.backoff_initial_ms, base.backoff_initial),
            backoff_max: ms(self.timeouts.backoff_max_ms, base.backoff_max),
        };

        let base = BalanceSettings::default();
        let balance = BalanceSettings {
            calibration: CalibrationState::new(
                self.balance.zero_offset.unwrap_or(base.calibration.zero_offset),
                self.balance.gain.or(base.calibration.gain),
            ),
            readings_per_request: self
                .balance
                .readings_per_request
                .unwrap_or(base.readings_per_request),
            stability_window: self.balance.stability_window.unwrap_or(base.stability_window),
            stability_tolerance: self
                .balance
                .stability_tolerance
                .unwrap_or(base.stability_tolerance),
            min_mass: self.balance.min_mass.unwrap_or(base.min_mass),
            measurement_rate_hz: self.balance.measurement_rate_hz.or(base.measurement_rate_hz),
            read_continuously: self
                .balance
                .read_continuously
                .unwrap_or(base.read_continuously),
        };

        DeviceConfig::new(self.name.clone(), self.kind, self.port.clone())
            .with_serial(serial)
            .with_timeouts(timeouts)
            .with_balance(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const FULL: &str = r#"
        [database]
        path = "data/weigh.db"

        [network]
        address = "127.0.0.1:3233"
        prefix = "weigh:"
        backoff_initial_ms = 100

        [dispatch]
        network_queue = 32
        storage_retry_max_ms = 1000

        [[device]]
        name = "rfid-1"
        kind = "reader"
        port = "/dev/ttyUSB0"

        [[device]]
        name = "balance-1"
        kind = "balance"
        port = "/dev/ttyUSB1"
        timeouts = { liveness_ms = 5000 }
        balance = { zero_offset = 100, gain = 0.25, min_mass = 50.0, measurement_rate_hz = 6, read_continuously = true }
    "#;

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(FULL).unwrap();
        assert_eq!(config.database.path, "data/weigh.db");
        assert_eq!(config.dispatch.network_queue, 32);
        assert_eq!(config.dispatch.storage_queue, DEFAULT_STORAGE_QUEUE);
        let dispatch = config.dispatch.to_dispatcher_config();
        assert_eq!(dispatch.storage_retry_initial, DEFAULT_STORAGE_RETRY_INITIAL);
        assert_eq!(dispatch.storage_retry_max, Duration::from_secs(1));

        let network = config.network.as_ref().unwrap().to_sink_config();
        assert_eq!(network.server_addr.port(), 3233);
        assert_eq!(network.prefix.as_deref(), Some("weigh:"));
        assert_eq!(network.backoff_initial, Duration::from_millis(100));

        let devices = config.device_configs();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0], DeviceConfig::reader("rfid-1", "/dev/ttyUSB0"));

        let balance = &devices[1];
        assert_eq!(balance.serial, SerialSettings::balance("/dev/ttyUSB1"));
        assert_eq!(balance.timeouts.liveness, Duration::from_secs(5));
        assert_eq!(
            balance.balance.calibration,
            CalibrationState::new(100, Some(0.25))
        );
        assert!(balance.balance.read_continuously);
        assert_eq!(balance.balance.min_mass, 50.0);
        assert_eq!(balance.balance.rate_code(), Some(4));
        balance.validate().unwrap();
    }

    #[test]
    fn test_minimal_config() {
        let config = AppConfig::from_toml("").unwrap();
        assert!(config.network.is_none());
        assert!(config.devices.is_empty());
        assert_eq!(config.database.path, "weigh.db");
        assert_eq!(config.coordinator.status_interval_secs, 60);
    }

    #[rstest]
    #[case("parity = \"odd\"", Parity::Odd, FlowControl::None)]
    #[case("flow_control = \"rts_cts\"", Parity::None, FlowControl::RtsCts)]
    #[case("baud_rate = 19200", Parity::None, FlowControl::None)]
    fn test_serial_overrides(
        #[case] line: &str,
        #[case] parity: Parity,
        #[case] flow_control: FlowControl,
    ) {
        let text = format!(
            "[[device]]\nname = \"rfid-1\"\nkind = \"reader\"\nport = \"COM3\"\n{}\n",
            line
        );
        let config = AppConfig::from_toml(&text).unwrap();
        let device = &config.device_configs()[0];
        assert_eq!(device.serial.parity, parity);
        assert_eq!(device.serial.flow_control, flow_control);
        assert_eq!(device.serial.port, "COM3");
    }

    #[rstest]
    #[case("[[device]]\nname = \"x\"\nkind = \"scanner\"\nport = \"COM1\"\n")]
    #[case("[[device]]\nname = \"x\"\nkind = \"reader\"\n")]
    #[case("[database]\nfile = \"weigh.db\"\n")]
    fn test_rejected_configs(#[case] text: &str) {
        assert!(AppConfig::from_toml(text).is_err());
    }

    #[test]
    fn test_database_override() {
        let section = DatabaseSection::default();
        assert_eq!(section.to_database_config(None).database_path, "weigh.db");
        assert_eq!(
            section.to_database_config(Some("/tmp/other.db")).database_path,
            "/tmp/other.db"
        );
    }
}
