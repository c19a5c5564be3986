//! Error taxonomy shared by every layer of the session manager.
//!
//! The variants map onto the four failure classes the supervisor reasons
//! about:
//!
//! | Class        | Variant(s)                       | Resolution                    |
//! |--------------|----------------------------------|-------------------------------|
//! | Connection   | [`Error::Connection`]            | retried with backoff          |
//! | Transport    | [`Error::Transport`], [`Error::Io`] | session torn down, reconnect |
//! | Protocol     | [`Error::Protocol`]              | reported, session continues   |
//! | Sink         | [`Error::SinkOverloaded`], [`Error::Sink`] | diagnostic only     |
//!
//! Everything else is a caller mistake (unknown device, bad command) and is
//! returned directly to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Session errors
    #[error("Cannot open {port}: {message}")]
    Connection { port: String, message: String },

    #[error("Transport failure on {port}: {message}")]
    Transport { port: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Sink errors
    #[error("Sink {sink} overloaded: no queue space after {waited_ms}ms")]
    SinkOverloaded { sink: String, waited_ms: u64 },

    #[error("Sink {sink} failed: {message}")]
    Sink { sink: String, message: String },

    // Caller errors
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Command rejected by {device}: {reason}")]
    CommandRejected { device: String, reason: String },

    #[error("Session for {0} is not running")]
    SessionStopped(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new connection error.
    pub fn connection(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Create a new transport error.
    pub fn transport(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Create a new protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a new sink failure.
    pub fn sink(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sink {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Create a new command rejection.
    pub fn command_rejected(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandRejected {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error for reporting inside a `DeviceError` event.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection { .. } => ErrorClass::Connection,
            Self::Transport { .. } | Self::Io(_) => ErrorClass::Transport,
            Self::Protocol(_) | Self::Calibration(_) => ErrorClass::Protocol,
            Self::SinkOverloaded { .. } | Self::Sink { .. } => ErrorClass::Sink,
            Self::UnknownDevice(_)
            | Self::CommandRejected { .. }
            | Self::SessionStopped(_)
            | Self::Config(_) => ErrorClass::Caller,
        }
    }

    /// Whether the error means the underlying connection is unusable.
    pub fn is_transport_failure(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}

/// Coarse error class carried on `DeviceError` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The port could not be opened.
    Connection,
    /// I/O failed on an open port.
    Transport,
    /// The device sent something the state machine did not expect.
    Protocol,
    /// The device itself reported a fault (e.g. a non-zero balance status).
    Device,
    /// The session crashed and was recovered at the supervisor boundary.
    Panic,
    /// A downstream sink could not keep up or failed.
    Sink,
    /// Misuse by the caller.
    Caller,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Device => "device",
            Self::Panic => "panic",
            Self::Sink => "sink",
            Self::Caller => "caller",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
