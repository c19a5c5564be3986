use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::{Error, Result};

/// The two instrument families the session manager understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// MULTITAG-125 RFID reader.
    Reader,
    /// AD105 weighing balance.
    Balance,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader => write!(f, "reader"),
            Self::Balance => write!(f, "balance"),
        }
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial flow control.
///
/// RTS/CTS can be configured, but the RFID reader hardware does not handle
/// it reliably, so reader defaults never select it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    #[default]
    None,
    XonXoff,
    RtsCts,
}

/// Connection parameters for one serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// OS port identifier (e.g. `/dev/ttyUSB0`, `COM3`).
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl SerialSettings {
    /// Reader line settings: 9600 8N1, no flow control.
    pub fn reader(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: DEFAULT_STOP_BITS,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }

    /// Balance line settings: 9600 8E1, XON/XOFF.
    pub fn balance(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: DEFAULT_STOP_BITS,
            parity: Parity::Even,
            flow_control: FlowControl::XonXoff,
        }
    }

    /// Default settings for the given device kind.
    pub fn for_kind(kind: DeviceKind, port: impl Into<String>) -> Self {
        match kind {
            DeviceKind::Reader => Self::reader(port),
            DeviceKind::Balance => Self::balance(port),
        }
    }

    /// Set the baud rate.
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the parity.
    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the flow control mode.
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        let flow = match self.flow_control {
            FlowControl::None => "no flow control",
            FlowControl::XonXoff => "XON/XOFF",
            FlowControl::RtsCts => "RTS/CTS",
        };
        write!(
            f,
            "{}, {} {}{}{}, {}",
            self.port, self.baud_rate, self.data_bits, parity, self.stop_bits, flow
        )
    }
}

/// Timing applied to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Silence on the line before the port is probed.
    pub liveness: Duration,
    /// Idle time after which a balance partial frame is discarded.
    pub partial_frame: Duration,
    /// Time allowed for a reply to a command.
    pub response: Duration,
    /// First reconnection delay.
    pub backoff_initial: Duration,
    /// Cap on reconnection delays.
    pub backoff_max: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            liveness: DEFAULT_LIVENESS_TIMEOUT,
            partial_frame: DEFAULT_PARTIAL_FRAME_TIMEOUT,
            response: DEFAULT_RESPONSE_TIMEOUT,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Balance calibration: `mass = (raw - zero_offset) * gain`.
///
/// The mass unit is whatever unit the known calibration mass was given in;
/// the rest of the system uses grams.
///
/// # Examples
///
/// ```
/// use weigh_core::CalibrationState;
///
/// let calibration = CalibrationState::default()
///     .tared(100)
///     .calibrated(500, 100.0)
///     .unwrap();
///
/// assert_eq!(calibration.zero_offset, 100);
/// assert_eq!(calibration.mass(500), Some(100.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Raw count read with nothing on the pan.
    pub zero_offset: i64,
    /// Mass per raw count. `None` until the balance has been calibrated.
    pub gain: Option<f64>,
}

impl CalibrationState {
    pub fn new(zero_offset: i64, gain: Option<f64>) -> Self {
        Self { zero_offset, gain }
    }

    pub fn is_calibrated(&self) -> bool {
        self.gain.is_some()
    }

    /// Convert a raw count to a mass, if calibrated.
    pub fn mass(&self, raw: i64) -> Option<f64> {
        self.gain.map(|gain| (raw - self.zero_offset) as f64 * gain)
    }

    /// Capture a new zero point. The gain is kept.
    pub fn tared(self, raw: i64) -> Self {
        Self {
            zero_offset: raw,
            gain: self.gain,
        }
    }

    /// Derive the gain from a reading taken with `known_mass` on the pan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Calibration`] if the reading equals the zero point
    /// or the known mass is not a positive finite number.
    pub fn calibrated(self, raw: i64, known_mass: f64) -> Result<Self> {
        if !known_mass.is_finite() || known_mass <= 0.0 {
            return Err(Error::Calibration(format!(
                "known mass must be positive, got {}",
                known_mass
            )));
        }
        let span = raw - self.zero_offset;
        if span == 0 {
            return Err(Error::Calibration(format!(
                "reference reading {} equals zero point",
                raw
            )));
        }
        Ok(Self {
            zero_offset: self.zero_offset,
            gain: Some(known_mass / span as f64),
        })
    }
}

/// Balance-specific parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSettings {
    /// Seed calibration, used when no stored calibration exists.
    pub calibration: CalibrationState,
    /// Readings requested per batch (`MSV?<n>;`).
    pub readings_per_request: u32,
    /// Consecutive readings that must agree for a reading to be stable.
    pub stability_window: usize,
    /// Largest spread in grams between readings considered stable.
    pub stability_tolerance: f64,
    /// Readings lighter than this (grams) are never reported stable.
    pub min_mass: f64,
    /// Measurement rate set during startup (`ICR`); device default if unset.
    pub measurement_rate_hz: Option<u32>,
    /// Request a new batch as soon as the previous one completes.
    pub read_continuously: bool,
}

impl BalanceSettings {
    /// The `ICR` code for [`measurement_rate_hz`](Self::measurement_rate_hz).
    pub fn rate_code(&self) -> Option<u8> {
        let hz = self.measurement_rate_hz?;
        BALANCE_RATE_CODES
            .iter()
            .find(|(rate, _)| *rate == hz)
            .map(|(_, code)| *code)
    }
}

impl Default for BalanceSettings {
    fn default() -> Self {
        Self {
            calibration: CalibrationState::default(),
            readings_per_request: DEFAULT_READINGS_PER_REQUEST,
            stability_window: DEFAULT_STABILITY_WINDOW,
            stability_tolerance: DEFAULT_STABILITY_TOLERANCE_GRAMS,
            min_mass: DEFAULT_MIN_MASS_GRAMS,
            measurement_rate_hz: None,
            read_continuously: false,
        }
    }
}

/// Everything needed to run one device session.
///
/// Produced by the configuration collaborator and never modified once the
/// session starts; a changed config replaces the session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Logical device name, unique across the coordinator.
    pub name: String,
    pub kind: DeviceKind,
    pub serial: SerialSettings,
    pub timeouts: SessionTimeouts,
    /// Only meaningful for balances.
    pub balance: BalanceSettings,
}

impl DeviceConfig {
    /// A reader on `port` with the reader's default line settings.
    pub fn reader(name: impl Into<String>, port: impl Into<String>) -> Self {
        Self::new(name, DeviceKind::Reader, port)
    }

    /// A balance on `port` with the balance's default line settings.
    pub fn balance(name: impl Into<String>, port: impl Into<String>) -> Self {
        Self::new(name, DeviceKind::Balance, port)
    }

    pub fn new(name: impl Into<String>, kind: DeviceKind, port: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            serial: SerialSettings::for_kind(kind, port),
            timeouts: SessionTimeouts::default(),
            balance: BalanceSettings::default(),
        }
    }

    /// Replace the serial settings.
    pub fn with_serial(mut self, serial: SerialSettings) -> Self {
        self.serial = serial;
        self
    }

    /// Replace the session timeouts.
    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Replace the balance settings.
    pub fn with_balance(mut self, balance: BalanceSettings) -> Self {
        self.balance = balance;
        self
    }

    /// Replace the seed calibration.
    pub fn with_calibration(mut self, calibration: CalibrationState) -> Self {
        self.balance.calibration = calibration;
        self
    }

    /// Check the config for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("device name must not be empty".to_string()));
        }
        if self.serial.port.trim().is_empty() {
            return Err(Error::Config(format!("{}: port must not be empty", self.name)));
        }
        if self.serial.baud_rate == 0 {
            return Err(Error::Config(format!("{}: baud rate must be positive", self.name)));
        }
        if self.kind == DeviceKind::Balance {
            if self.balance.readings_per_request == 0 {
                return Err(Error::Config(format!(
                    "{}: readings_per_request must be positive",
                    self.name
                )));
            }
            if self.balance.stability_window == 0 {
                return Err(Error::Config(format!(
                    "{}: stability_window must be positive",
                    self.name
                )));
            }
            if let Some(hz) = self.balance.measurement_rate_hz
                && self.balance.rate_code().is_none()
            {
                return Err(Error::Config(format!(
                    "{}: unsupported measurement rate {} Hz",
                    self.name, hz
                )));
            }
        }
        if self.timeouts.backoff_initial.is_zero()
            || self.timeouts.backoff_initial > self.timeouts.backoff_max
        {
            return Err(Error::Config(format!(
                "{}: backoff must satisfy 0 < initial <= max",
                self.name
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a device session, as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not running (never started, or stopped).
    Disconnected,
    /// Opening the port.
    Connecting,
    /// Port open, protocol running.
    Connected,
    /// Last attempt failed; waiting to retry.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Reader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderCommand {
    /// `c`: begin continuous reading.
    Start,
    /// `p`: stop reading.
    Stop,
    /// `x`: reset.
    Reset,
}

/// Balance commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceCommand {
    /// `RES;`: warm restart.
    Restart,
    /// `ESR?;`: status query.
    Status,
    /// `COF3;`: ASCII result output.
    AsciiMode,
    /// `MSV?<n>;`: request `n` readings.
    Readings(u32),
    /// `STP;`: stop measuring and forget outstanding readings.
    StopMeasuring,
    /// `IDN?;`: identification query.
    Identify,
    /// `ICR<code>;`: set the measurement rate.
    MeasurementRate(u8),
    /// Capture the next reading as the zero point.
    Tare,
    /// Capture the next reading as `known_mass` (grams).
    Calibrate { known_mass: f64 },
}

/// A command for either device kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    Reader(ReaderCommand),
    Balance(BalanceCommand),
}

impl DeviceCommand {
    /// The device kind this command is meant for.
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Reader(_) => DeviceKind::Reader,
            Self::Balance(_) => DeviceKind::Balance,
        }
    }
}

impl From<ReaderCommand> for DeviceCommand {
    fn from(command: ReaderCommand) -> Self {
        Self::Reader(command)
    }
}

impl From<BalanceCommand> for DeviceCommand {
    fn from(command: BalanceCommand) -> Self {
        Self::Balance(command)
    }
}

/// An outbound instruction with an optional caller-supplied token.
///
/// The token is echoed on events produced in reply to the command, so a
/// caller can match replies to requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: DeviceCommand,
    pub correlation: Option<String>,
}

impl CommandRequest {
    pub fn new(command: impl Into<DeviceCommand>) -> Self {
        Self {
            command: command.into(),
            correlation: None,
        }
    }

    /// Attach a correlation token.
    pub fn with_correlation(mut self, token: impl Into<String>) -> Self {
        self.correlation = Some(token.into());
        self
    }
}

impl From<ReaderCommand> for CommandRequest {
    fn from(command: ReaderCommand) -> Self {
        Self::new(command)
    }
}

impl From<BalanceCommand> for CommandRequest {
    fn from(command: BalanceCommand) -> Self {
        Self::new(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_reader_serial_defaults() {
        let serial = SerialSettings::reader("/dev/ttyUSB0");
        assert_eq!(serial.baud_rate, 9600);
        assert_eq!(serial.data_bits, 8);
        assert_eq!(serial.stop_bits, 1);
        assert_eq!(serial.parity, Parity::None);
        assert_eq!(serial.flow_control, FlowControl::None);
    }

    #[test]
    fn test_balance_serial_defaults() {
        let serial = SerialSettings::balance("/dev/ttyUSB1");
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.flow_control, FlowControl::XonXoff);
        assert_eq!(serial.to_string(), "/dev/ttyUSB1, 9600 8E1, XON/XOFF");
    }

    #[test]
    fn test_calibration_round_trip() {
        let calibration = CalibrationState::default()
            .tared(100)
            .calibrated(500, 0.1)
            .unwrap();

        assert_eq!(calibration.zero_offset, 100);
        let gain = calibration.gain.unwrap();
        assert!((gain - 0.1 / 400.0).abs() < 1e-15);
        assert!((calibration.mass(500).unwrap() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_tare_keeps_gain() {
        let calibration = CalibrationState::new(100, Some(0.25)).tared(120);
        assert_eq!(calibration.zero_offset, 120);
        assert_eq!(calibration.gain, Some(0.25));
        assert_eq!(calibration.mass(520), Some(100.0));
    }

    #[test]
    fn test_uncalibrated_has_no_mass() {
        let calibration = CalibrationState::default();
        assert!(!calibration.is_calibrated());
        assert_eq!(calibration.mass(1234), None);
    }

    #[rstest]
    #[case(100, 100.0)] // reading equals zero point
    #[case(500, 0.0)] // zero mass
    #[case(500, -5.0)] // negative mass
    #[case(500, f64::NAN)]
    fn test_calibration_rejected(#[case] raw: i64, #[case] known_mass: f64) {
        let result = CalibrationState::default().tared(100).calibrated(raw, known_mass);
        assert!(matches!(result, Err(Error::Calibration(_))));
    }

    #[test]
    fn test_device_config_validation() {
        assert!(DeviceConfig::reader("rfid-1", "/dev/ttyUSB0").validate().is_ok());
        assert!(DeviceConfig::reader("", "/dev/ttyUSB0").validate().is_err());
        assert!(DeviceConfig::reader("rfid-1", " ").validate().is_err());

        let mut balance = DeviceConfig::balance("balance-1", "/dev/ttyUSB1");
        balance.balance.readings_per_request = 0;
        assert!(balance.validate().is_err());
    }

    #[rstest]
    #[case(None, true)]
    #[case(Some(6), true)]
    #[case(Some(100), true)]
    #[case(Some(7), false)]
    fn test_measurement_rate_validation(#[case] hz: Option<u32>, #[case] valid: bool) {
        let mut balance = DeviceConfig::balance("balance-1", "/dev/ttyUSB1");
        balance.balance.measurement_rate_hz = hz;
        assert_eq!(balance.validate().is_ok(), valid);
        if hz == Some(6) {
            assert_eq!(balance.balance.rate_code(), Some(4));
        }
    }

    #[test]
    fn test_command_kind() {
        let request = CommandRequest::new(ReaderCommand::Start).with_correlation("abc");
        assert_eq!(request.command.kind(), DeviceKind::Reader);
        assert_eq!(request.correlation.as_deref(), Some("abc"));

        let request: CommandRequest = BalanceCommand::Readings(3).into();
        assert_eq!(request.command.kind(), DeviceKind::Balance);
        assert!(request.correlation.is_none());
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Connected.to_string(), "Connected");
        assert_eq!(SessionState::Failed.to_string(), "Failed");
    }
}
