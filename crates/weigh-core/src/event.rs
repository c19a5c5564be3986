//! Events produced by device sessions.
//!
//! A [`ProtocolEvent`] is produced exactly once per physical occurrence and
//! never modified afterwards. State machines only produce the payload part
//! ([`ProtocolOutput`]); the session supervisor stamps the device name, the
//! per-device sequence number and the timestamp.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;
use crate::types::CalibrationState;

/// A device event as it leaves the session manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// Logical device name.
    pub device: String,
    /// Strictly increasing per device, across reconnections.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Token of the command this event replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    pub payload: EventPayload,
}

impl ProtocolEvent {
    pub fn new(
        device: impl Into<String>,
        sequence: u64,
        timestamp: DateTime<Utc>,
        output: ProtocolOutput,
    ) -> Self {
        Self {
            device: device.into(),
            sequence,
            timestamp,
            correlation: output.correlation,
            payload: output.payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}] {}", self.device, self.sequence, self.payload)
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// An RFID tag was read.
    TagDetected {
        /// 15-digit animal ID (country * 10^12 + national ID).
        code: u64,
        /// Tag line exactly as received.
        raw: String,
    },
    /// A calibrated balance reading.
    MassReading { grams: f64, raw: i64, stable: bool },
    /// Something went wrong; the session may or may not continue.
    DeviceError {
        class: ErrorClass,
        reason: String,
        /// Device-reported code, preserved verbatim (e.g. a balance status).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    DeviceConnected,
    DeviceDisconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A balance was tared or calibrated.
    CalibrationChanged { zero_offset: i64, gain: Option<f64> },
    /// A sink's queue stayed full for `waited_ms`. Raised by the dispatcher,
    /// not by a device.
    SinkOverloaded { sink: String, waited_ms: u64 },
}

impl EventPayload {
    /// A `DeviceError` payload without a device code.
    pub fn error(class: ErrorClass, reason: impl Into<String>) -> Self {
        Self::DeviceError {
            class,
            reason: reason.into(),
            code: None,
        }
    }

    pub fn calibration(calibration: CalibrationState) -> Self {
        Self::CalibrationChanged {
            zero_offset: calibration.zero_offset,
            gain: calibration.gain,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::TagDetected { .. } => EventKind::TagDetected,
            Self::MassReading { .. } => EventKind::MassReading,
            Self::DeviceError { .. } => EventKind::DeviceError,
            Self::DeviceConnected => EventKind::DeviceConnected,
            Self::DeviceDisconnected { .. } => EventKind::DeviceDisconnected,
            Self::CalibrationChanged { .. } => EventKind::CalibrationChanged,
            Self::SinkOverloaded { .. } => EventKind::SinkOverloaded,
        }
    }

    /// The calibration carried by a `CalibrationChanged` payload.
    pub fn as_calibration(&self) -> Option<CalibrationState> {
        match self {
            Self::CalibrationChanged { zero_offset, gain } => {
                Some(CalibrationState::new(*zero_offset, *gain))
            }
            _ => None,
        }
    }
}

impl fmt::Display for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TagDetected { code, .. } => write!(f, "tag {:015}", code),
            Self::MassReading { grams, stable, .. } => {
                write!(f, "mass {:.3} g{}", grams, if *stable { " (stable)" } else { "" })
            }
            Self::DeviceError { class, reason, code } => match code {
                Some(code) => write!(f, "{} error: {} [{}]", class, reason, code),
                None => write!(f, "{} error: {}", class, reason),
            },
            Self::DeviceConnected => write!(f, "connected"),
            Self::DeviceDisconnected { reason } => match reason {
                Some(reason) => write!(f, "disconnected: {}", reason),
                None => write!(f, "disconnected"),
            },
            Self::CalibrationChanged { zero_offset, gain } => match gain {
                Some(gain) => write!(f, "calibration zero={} gain={}", zero_offset, gain),
                None => write!(f, "calibration zero={} (no gain)", zero_offset),
            },
            Self::SinkOverloaded { sink, waited_ms } => {
                write!(f, "sink {} overloaded after {}ms", sink, waited_ms)
            }
        }
    }
}

/// Discriminant of [`EventPayload`], used as the stored event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TagDetected,
    MassReading,
    DeviceError,
    DeviceConnected,
    DeviceDisconnected,
    CalibrationChanged,
    SinkOverloaded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TagDetected => "tag_detected",
            Self::MassReading => "mass_reading",
            Self::DeviceError => "device_error",
            Self::DeviceConnected => "device_connected",
            Self::DeviceDisconnected => "device_disconnected",
            Self::CalibrationChanged => "calibration_changed",
            Self::SinkOverloaded => "sink_overloaded",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a protocol state machine, before the session stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolOutput {
    pub payload: EventPayload,
    pub correlation: Option<String>,
}

impl ProtocolOutput {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            correlation: None,
        }
    }

    pub fn correlated(payload: EventPayload, correlation: Option<String>) -> Self {
        Self {
            payload,
            correlation,
        }
    }
}

impl From<EventPayload> for ProtocolOutput {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}
