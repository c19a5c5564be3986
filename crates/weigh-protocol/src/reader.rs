//! RFID reader protocol state machine.
//!
//! ```text
//! Idle --'c'--> Streaming --'p'--> Idle
//!   any --'x'--> Idle (banner expected)
//! ```
//!
//! The reader sends CR LF terminated lines. Characters arrive one at a time
//! and are assembled into lines here. While streaming, every line that is a
//! valid tag code becomes a `TagDetected` event.
//!
//! A start requested while the reader is still resetting is held back until
//! the banner arrives (or the banner wait times out); a `c` sent during a
//! reset is swallowed by the device.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weigh_core::constants::*;
use weigh_core::{
    CommandRequest, DeviceCommand, Error, ErrorClass, EventPayload, ProtocolOutput,
    ReaderCommand, Result,
};

use crate::codec::ProtocolUnit;
use crate::tag::AnimalTag;
use crate::ProtocolState;

/// A sent command whose reply is still due.
#[derive(Debug)]
struct Pending {
    deadline: Instant,
    correlation: Option<String>,
}

/// State machine for one RFID reader.
#[derive(Debug)]
pub struct ReaderProtocol {
    name: String,
    state: ProtocolState,
    line: Vec<u8>,
    overflowed: bool,
    response_timeout: Duration,
    awaiting_banner: Option<Pending>,
    pending_stop: Option<Pending>,
    deferred_start: Option<Option<String>>,
    streaming_correlation: Option<String>,
    last_correlation: Option<String>,
    outgoing: VecDeque<Bytes>,
}

impl ReaderProtocol {
    pub fn new(name: impl Into<String>, response_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            state: ProtocolState::Idle,
            line: Vec::with_capacity(READER_MAX_LINE),
            overflowed: false,
            response_timeout,
            awaiting_banner: None,
            pending_stop: None,
            deferred_start: None,
            streaming_correlation: None,
            last_correlation: None,
            outgoing: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Whether a reset was sent and the banner has not arrived yet.
    pub fn is_resetting(&self) -> bool {
        self.awaiting_banner.is_some()
    }

    /// Bytes to send for `request`. May be empty when the command is deferred.
    pub fn issue(&mut self, request: CommandRequest, now: Instant) -> Result<Bytes> {
        let command = match request.command {
            DeviceCommand::Reader(command) => command,
            DeviceCommand::Balance(other) => {
                return Err(Error::command_rejected(
                    &self.name,
                    format!("{:?} is not a reader command", other),
                ));
            }
        };
        self.last_correlation = request.correlation.clone();

        match command {
            ReaderCommand::Start => {
                if self.awaiting_banner.is_some() {
                    debug!(device = %self.name, "Start deferred until reset completes");
                    self.deferred_start = Some(request.correlation);
                    return Ok(Bytes::new());
                }
                self.begin_streaming(request.correlation);
                Ok(Bytes::from_static(&[READER_CMD_START]))
            }
            ReaderCommand::Stop => {
                self.state = ProtocolState::Idle;
                self.deferred_start = None;
                self.streaming_correlation = None;
                self.pending_stop = Some(Pending {
                    deadline: now + self.response_timeout,
                    correlation: request.correlation,
                });
                Ok(Bytes::from_static(&[READER_CMD_STOP]))
            }
            ReaderCommand::Reset => {
                self.state = ProtocolState::Idle;
                self.line.clear();
                self.overflowed = false;
                self.deferred_start = None;
                self.pending_stop = None;
                self.streaming_correlation = None;
                self.awaiting_banner = Some(Pending {
                    deadline: now + self.response_timeout,
                    correlation: request.correlation,
                });
                Ok(Bytes::from_static(&[READER_CMD_RESET]))
            }
        }
    }

    pub fn consume_frame(&mut self, unit: ProtocolUnit, _now: Instant) -> Vec<ProtocolOutput> {
        match unit {
            ProtocolUnit::Char(b'\r' | b'\n') => {
                if std::mem::take(&mut self.overflowed) {
                    self.line.clear();
                    return Vec::new();
                }
                if self.line.is_empty() {
                    return Vec::new();
                }
                let line = String::from_utf8_lossy(&self.line).trim().to_string();
                self.line.clear();
                self.process_line(&line)
            }
            ProtocolUnit::Char(byte) => {
                if self.overflowed {
                    return Vec::new();
                }
                if self.line.len() >= READER_MAX_LINE {
                    self.line.clear();
                    self.overflowed = true;
                    return vec![self.error(
                        ErrorClass::Protocol,
                        format!("line exceeds {} bytes without terminator", READER_MAX_LINE),
                        None,
                    )];
                }
                self.line.push(byte);
                Vec::new()
            }
            ProtocolUnit::Frame(line) => self.process_line(line.trim()),
            ProtocolUnit::Malformed(reason) => {
                vec![self.error(ErrorClass::Protocol, reason, None)]
            }
        }
    }

    /// Drop expectations whose deadline has passed.
    ///
    /// A missing `S` after a stop is never chased: the stop is not resent.
    pub fn expire(&mut self, now: Instant) -> Vec<ProtocolOutput> {
        if self.pending_stop.as_ref().is_some_and(|p| p.deadline <= now) {
            self.pending_stop = None;
            debug!(device = %self.name, "No stop acknowledgement from reader");
        }
        if self.awaiting_banner.as_ref().is_some_and(|p| p.deadline <= now) {
            let reset = self.awaiting_banner.take().and_then(|p| p.correlation);
            warn!(device = %self.name, correlation = ?reset, "No banner after reset");
            self.release_deferred_start();
        }
        Vec::new()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [&self.pending_stop, &self.awaiting_banner]
            .into_iter()
            .flatten()
            .map(|p| p.deadline)
            .min()
    }

    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front()
    }

    fn begin_streaming(&mut self, correlation: Option<String>) {
        self.state = ProtocolState::Streaming;
        self.pending_stop = None;
        self.streaming_correlation = correlation;
    }

    fn release_deferred_start(&mut self) {
        if let Some(correlation) = self.deferred_start.take() {
            self.begin_streaming(correlation);
            self.outgoing.push_back(Bytes::from_static(&[READER_CMD_START]));
        }
    }

    fn process_line(&mut self, line: &str) -> Vec<ProtocolOutput> {
        match line {
            "" => Vec::new(),
            READER_REPLY_INVALID => {
                vec![self.error(ErrorClass::Protocol, "unrecognized command", None)]
            }
            READER_REPLY_NOT_EXECUTED => vec![self.error(
                ErrorClass::Device,
                "command not executed",
                Some(line.to_string()),
            )],
            READER_REPLY_STOPPED => {
                if let Some(stop) = self.pending_stop.take() {
                    debug!(device = %self.name, correlation = ?stop.correlation, "Reader acknowledged stop");
                } else if self.state == ProtocolState::Streaming {
                    warn!(device = %self.name, "Reader stopped reading on its own");
                    self.state = ProtocolState::Idle;
                    self.streaming_correlation = None;
                }
                Vec::new()
            }
            READER_REPLY_ANTENNA_OFF => {
                info!(device = %self.name, "Reader antenna off");
                Vec::new()
            }
            banner if banner.starts_with(READER_BANNER_PREFIX) => {
                let reset = self.awaiting_banner.take().and_then(|p| p.correlation);
                info!(device = %self.name, banner = %banner, correlation = ?reset, "Reader says hello");
                self.release_deferred_start();
                Vec::new()
            }
            line if self.state == ProtocolState::Streaming => match AnimalTag::parse(line) {
                Ok(tag) => {
                    debug!(device = %self.name, tag = %tag, "Tag detected");
                    vec![ProtocolOutput::correlated(
                        EventPayload::TagDetected {
                            code: tag.code(),
                            raw: line.to_string(),
                        },
                        self.streaming_correlation.clone(),
                    )]
                }
                Err(e) => vec![self.error(ErrorClass::Protocol, e.to_string(), None)],
            },
            line => {
                debug!(device = %self.name, line = %line, "Ignoring line while not streaming");
                Vec::new()
            }
        }
    }

    fn error(
        &self,
        class: ErrorClass,
        reason: impl Into<String>,
        code: Option<String>,
    ) -> ProtocolOutput {
        let reason = reason.into();
        warn!(device = %self.name, class = %class, reason = %reason, "Reader error");
        ProtocolOutput::correlated(
            EventPayload::DeviceError {
                class,
                reason,
                code,
            },
            self.reply_correlation(),
        )
    }

    /// Token of the command a reply most likely answers: an unacknowledged
    /// stop or reset first, then the last command issued.
    fn reply_correlation(&self) -> Option<String> {
        [&self.pending_stop, &self.awaiting_banner]
            .into_iter()
            .flatten()
            .find_map(|p| p.correlation.clone())
            .or_else(|| self.last_correlation.clone())
    }
}
