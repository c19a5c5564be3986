//! The device protocol abstraction shared by readers and balances.
//!
//! [`DeviceProtocol`] is a closed sum over the two supported instruments.
//! Every variant follows the same lifecycle contract:
//!
//! - [`consume_frame`](DeviceProtocol::consume_frame) interprets one unit
//!   from the transport and returns zero or more events;
//! - [`issue`](DeviceProtocol::issue) turns a command into wire bytes;
//! - [`expire`](DeviceProtocol::expire) drops replies that never came;
//! - [`take_outgoing`](DeviceProtocol::take_outgoing) yields commands the
//!   machine decided to send on its own (deferred starts, continuous reads).
//!
//! A machine never touches I/O and never sees wall-clock time except through
//! the `now` arguments, so it can be driven entirely from tests.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use weigh_core::{
    BalanceCommand, CalibrationState, CommandRequest, DeviceConfig, DeviceKind, ProtocolOutput,
    ReaderCommand, Result,
};

use crate::balance::BalanceProtocol;
use crate::codec::{DeviceCodec, ProtocolUnit};
use crate::reader::ReaderProtocol;

/// Lifecycle state common to all device protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    /// Ready for a command; nothing outstanding.
    Idle,
    /// A command was sent and its acknowledgement is outstanding.
    AwaitingAck,
    /// Data is flowing (reader: continuous read; balance: readings batch).
    Streaming,
    /// The device reported a fault; only a restart clears it.
    Error,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state_str = match self {
            ProtocolState::Idle => "Idle",
            ProtocolState::AwaitingAck => "AwaitingAck",
            ProtocolState::Streaming => "Streaming",
            ProtocolState::Error => "Error",
        };
        write!(f, "{}", state_str)
    }
}

/// A protocol state machine for either device kind.
#[derive(Debug)]
pub enum DeviceProtocol {
    Reader(ReaderProtocol),
    Balance(BalanceProtocol),
}

impl DeviceProtocol {
    /// A fresh machine in `Idle` for `config`.
    ///
    /// `calibration` overrides the config's seed calibration; balances use
    /// it, readers ignore it.
    pub fn for_config(config: &DeviceConfig, calibration: Option<CalibrationState>) -> Self {
        match config.kind {
            DeviceKind::Reader => {
                Self::Reader(ReaderProtocol::new(&config.name, config.timeouts.response))
            }
            DeviceKind::Balance => Self::Balance(BalanceProtocol::new(
                &config.name,
                config.balance.clone(),
                calibration.unwrap_or(config.balance.calibration),
                config.timeouts.response,
            )),
        }
    }

    /// The codec matching this machine's framing.
    pub fn codec_for(config: &DeviceConfig) -> DeviceCodec {
        DeviceCodec::for_kind(config.kind, config.timeouts.partial_frame)
    }

    /// Commands sent when a session comes up.
    ///
    /// A reader is reset and put into continuous read. A balance is switched
    /// to ASCII output, identified, has its status queried and its
    /// measurement rate set when one is configured, plus a first batch when
    /// it reads continuously.
    pub fn start_sequence(config: &DeviceConfig) -> Vec<CommandRequest> {
        match config.kind {
            DeviceKind::Reader => vec![ReaderCommand::Reset.into(), ReaderCommand::Start.into()],
            DeviceKind::Balance => {
                let mut commands = vec![
                    BalanceCommand::AsciiMode.into(),
                    BalanceCommand::Identify.into(),
                    BalanceCommand::Status.into(),
                ];
                if let Some(code) = config.balance.rate_code() {
                    commands.push(BalanceCommand::MeasurementRate(code).into());
                }
                if config.balance.read_continuously {
                    commands.push(BalanceCommand::Readings(config.balance.readings_per_request).into());
                }
                commands
            }
        }
    }

    /// Commands sent, best effort, before a stopped session releases the port.
    pub fn stop_sequence(config: &DeviceConfig) -> Vec<CommandRequest> {
        match config.kind {
            DeviceKind::Reader => vec![ReaderCommand::Stop.into()],
            DeviceKind::Balance => vec![BalanceCommand::StopMeasuring.into()],
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Reader(_) => DeviceKind::Reader,
            Self::Balance(_) => DeviceKind::Balance,
        }
    }

    pub fn state(&self) -> ProtocolState {
        match self {
            Self::Reader(reader) => reader.state(),
            Self::Balance(balance) => balance.state(),
        }
    }

    pub fn consume_frame(&mut self, unit: ProtocolUnit, now: Instant) -> Vec<ProtocolOutput> {
        match self {
            Self::Reader(reader) => reader.consume_frame(unit, now),
            Self::Balance(balance) => balance.consume_frame(unit, now),
        }
    }

    /// Wire bytes for `request`; empty when nothing needs sending right now.
    ///
    /// # Errors
    ///
    /// Returns [`weigh_core::Error::CommandRejected`] for a command meant for
    /// the other device kind or one the current state forbids.
    pub fn issue(&mut self, request: CommandRequest, now: Instant) -> Result<Bytes> {
        match self {
            Self::Reader(reader) => reader.issue(request, now),
            Self::Balance(balance) => balance.issue(request, now),
        }
    }

    pub fn expire(&mut self, now: Instant) -> Vec<ProtocolOutput> {
        match self {
            Self::Reader(reader) => reader.expire(now),
            Self::Balance(balance) => balance.expire(now),
        }
    }

    /// Earliest instant at which [`expire`](Self::expire) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            Self::Reader(reader) => reader.next_deadline(),
            Self::Balance(balance) => balance.next_deadline(),
        }
    }

    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        match self {
            Self::Reader(reader) => reader.take_outgoing(),
            Self::Balance(balance) => balance.take_outgoing(),
        }
    }

    /// Current calibration; `None` for readers.
    pub fn calibration(&self) -> Option<CalibrationState> {
        match self {
            Self::Reader(_) => None,
            Self::Balance(balance) => Some(balance.calibration()),
        }
    }
}
