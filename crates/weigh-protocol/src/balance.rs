//! Balance protocol state machine.
//!
//! The balance answers commands strictly in order, so every command that
//! expects a reply pushes an expectation onto a FIFO and every received
//! frame is matched against the front of it:
//!
//! | Command    | Reply                    | Expectation             |
//! |------------|--------------------------|-------------------------|
//! | `RES;`     | none                     | clears the queue        |
//! | `STP;`     | none                     | drops pending readings  |
//! | `ESR?;`    | 3-digit status code      | `Status`                |
//! | `IDN?;`    | identification string    | `Identity`              |
//! | `COF3;`    | `0`                      | `Ack`                   |
//! | `ICRn;`    | `0`                      | `Ack`                   |
//! | `MSV?n;`   | up to `n` integer lines  | `Readings { remaining }`|
//!
//! A `?` answers whatever is at the front. Inside a batch every line, good
//! or bad, uses up one of the `n` readings; the batch ends when all `n` have
//! arrived or the response timeout passes. Other expectations that outlive
//! the response timeout are dropped by [`BalanceProtocol::expire`].
//!
//! Raw readings are converted with the current [`CalibrationState`]. A
//! pending tare or calibration consumes the next raw reading instead.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weigh_core::constants::*;
use weigh_core::{
    BalanceCommand, BalanceSettings, CalibrationState, CommandRequest, DeviceCommand, Error,
    ErrorClass, EventPayload, ProtocolOutput, Result,
};

use crate::codec::ProtocolUnit;
use crate::ProtocolState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expectation {
    Status,
    Identity,
    Ack(&'static str),
    Readings { remaining: u32 },
}

impl Expectation {
    fn command(&self) -> &'static str {
        match self {
            Self::Status => BALANCE_CMD_STATUS,
            Self::Identity => BALANCE_CMD_IDENTIFY,
            Self::Ack(command) => command,
            Self::Readings { .. } => BALANCE_CMD_READINGS,
        }
    }
}

#[derive(Debug)]
struct Outstanding {
    expectation: Expectation,
    deadline: Instant,
    correlation: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum CalibrationPhase {
    Idle,
    AwaitingZero { correlation: Option<String> },
    AwaitingLoad { known_mass: f64, correlation: Option<String> },
}

/// State machine for one balance.
#[derive(Debug)]
pub struct BalanceProtocol {
    name: String,
    settings: BalanceSettings,
    calibration: CalibrationState,
    phase: CalibrationPhase,
    expectations: VecDeque<Outstanding>,
    window: VecDeque<f64>,
    hardware_fault: bool,
    identity: Option<String>,
    response_timeout: Duration,
    outgoing: VecDeque<Bytes>,
}

impl BalanceProtocol {
    pub fn new(
        name: impl Into<String>,
        settings: BalanceSettings,
        calibration: CalibrationState,
        response_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            calibration,
            phase: CalibrationPhase::Idle,
            expectations: VecDeque::new(),
            window: VecDeque::new(),
            hardware_fault: false,
            identity: None,
            response_timeout,
            outgoing: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ProtocolState {
        if self.hardware_fault {
            return ProtocolState::Error;
        }
        match self.expectations.front().map(|o| o.expectation) {
            None => ProtocolState::Idle,
            Some(Expectation::Status | Expectation::Identity | Expectation::Ack(_)) => {
                ProtocolState::AwaitingAck
            }
            Some(Expectation::Readings { .. }) => ProtocolState::Streaming,
        }
    }

    pub fn calibration(&self) -> CalibrationState {
        self.calibration
    }

    /// Identification string reported by `IDN?`, once answered.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Whether a tare or calibration is waiting for its reading.
    pub fn calibration_pending(&self) -> bool {
        self.phase != CalibrationPhase::Idle
    }

    /// Bytes to send for `request`. Empty when nothing needs sending (e.g. a
    /// tare while a batch is already outstanding).
    pub fn issue(&mut self, request: CommandRequest, now: Instant) -> Result<Bytes> {
        let command = match request.command {
            DeviceCommand::Balance(command) => command,
            DeviceCommand::Reader(other) => {
                return Err(Error::command_rejected(
                    &self.name,
                    format!("{:?} is not a balance command", other),
                ));
            }
        };
        if self.hardware_fault
            && !matches!(
                command,
                BalanceCommand::Restart
                    | BalanceCommand::Status
                    | BalanceCommand::Identify
                    | BalanceCommand::StopMeasuring
            )
        {
            return Err(Error::command_rejected(
                &self.name,
                "balance reported a hardware error; restart required",
            ));
        }
        let correlation = request.correlation;

        match command {
            BalanceCommand::Restart => {
                if !self.expectations.is_empty() {
                    debug!(
                        device = %self.name,
                        dropped = self.expectations.len(),
                        "Restart drops outstanding replies"
                    );
                }
                self.expectations.clear();
                self.window.clear();
                self.phase = CalibrationPhase::Idle;
                self.hardware_fault = false;
                Ok(command_bytes(BALANCE_CMD_RESTART))
            }
            BalanceCommand::Status => {
                self.expect(Expectation::Status, correlation, now);
                Ok(command_bytes(BALANCE_CMD_STATUS))
            }
            BalanceCommand::StopMeasuring => {
                self.stop_measuring();
                Ok(command_bytes(BALANCE_CMD_STOP))
            }
            BalanceCommand::Identify => {
                self.expect(Expectation::Identity, correlation, now);
                Ok(command_bytes(BALANCE_CMD_IDENTIFY))
            }
            BalanceCommand::AsciiMode => {
                self.expect(Expectation::Ack(BALANCE_CMD_ASCII), correlation, now);
                Ok(command_bytes(BALANCE_CMD_ASCII))
            }
            BalanceCommand::MeasurementRate(code) => {
                if !BALANCE_RATE_CODES.iter().any(|(_, known)| *known == code) {
                    return Err(Error::command_rejected(
                        &self.name,
                        format!("unknown measurement rate code {}", code),
                    ));
                }
                self.expect(Expectation::Ack(BALANCE_CMD_RATE), correlation, now);
                Ok(command_bytes(&format!("{}{}", BALANCE_CMD_RATE, code)))
            }
            BalanceCommand::Readings(0) => Err(Error::command_rejected(
                &self.name,
                "readings request must ask for at least one reading",
            )),
            BalanceCommand::Readings(n) => Ok(self.request_readings(n, correlation, now)),
            BalanceCommand::Tare => {
                self.phase = CalibrationPhase::AwaitingZero {
                    correlation: correlation.clone(),
                };
                Ok(self.ensure_batch(correlation, now))
            }
            BalanceCommand::Calibrate { known_mass } => {
                if !known_mass.is_finite() || known_mass <= 0.0 {
                    return Err(Error::Calibration(format!(
                        "known mass must be positive, got {}",
                        known_mass
                    )));
                }
                self.phase = CalibrationPhase::AwaitingLoad {
                    known_mass,
                    correlation: correlation.clone(),
                };
                Ok(self.ensure_batch(correlation, now))
            }
        }
    }

    pub fn consume_frame(&mut self, unit: ProtocolUnit, now: Instant) -> Vec<ProtocolOutput> {
        match unit {
            ProtocolUnit::Frame(frame) => self.consume_reply(frame.trim(), now),
            ProtocolUnit::Char(byte) => self.consume_reply(&char::from(byte).to_string(), now),
            ProtocolUnit::Malformed(reason) => {
                if self.batch_in_front() {
                    return self.consume_bad_reading(reason, now);
                }
                let correlation = self.abandon_front();
                vec![self.error(ErrorClass::Protocol, reason, None, correlation)]
            }
        }
    }

    /// Drop expectations whose deadline has passed, one `DeviceError` each.
    pub fn expire(&mut self, now: Instant) -> Vec<ProtocolOutput> {
        let mut outputs = Vec::new();
        while self.expectations.front().is_some_and(|o| o.deadline <= now) {
            let command = self.expectations.front().map(|o| o.expectation.command());
            let correlation = self.abandon_front();
            outputs.push(self.error(
                ErrorClass::Protocol,
                format!(
                    "no reply to {} within {}ms",
                    command.unwrap_or_default(),
                    self.response_timeout.as_millis()
                ),
                None,
                correlation,
            ));
            self.continue_reading(now);
        }
        outputs
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.expectations.front().map(|o| o.deadline)
    }

    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front()
    }

    fn expect(&mut self, expectation: Expectation, correlation: Option<String>, now: Instant) {
        self.expectations.push_back(Outstanding {
            expectation,
            deadline: now + self.response_timeout,
            correlation,
        });
    }

    fn request_readings(&mut self, n: u32, correlation: Option<String>, now: Instant) -> Bytes {
        self.expect(Expectation::Readings { remaining: n }, correlation, now);
        command_bytes(&format!("{}{}", BALANCE_CMD_READINGS, n))
    }

    fn readings_outstanding(&self) -> bool {
        self.expectations
            .iter()
            .any(|o| matches!(o.expectation, Expectation::Readings { .. }))
    }

    fn ensure_batch(&mut self, correlation: Option<String>, now: Instant) -> Bytes {
        if self.readings_outstanding() {
            return Bytes::new();
        }
        self.request_readings(self.settings.readings_per_request, correlation, now)
    }

    fn batch_in_front(&self) -> bool {
        self.expectations
            .front()
            .is_some_and(|o| matches!(o.expectation, Expectation::Readings { .. }))
    }

    /// Use up one reading of the batch at the front. Returns the batch's
    /// correlation and whether that was its last reading.
    fn count_reading(&mut self, now: Instant) -> (Option<String>, bool) {
        let Some(front) = self.expectations.front_mut() else {
            return (None, false);
        };
        let Expectation::Readings { remaining } = front.expectation else {
            return (None, false);
        };
        let remaining = remaining.saturating_sub(1);
        front.expectation = Expectation::Readings { remaining };
        front.deadline = now + self.response_timeout;
        (front.correlation.clone(), remaining == 0)
    }

    /// Retire the completed batch at the front and start the next one when
    /// reading continuously. A tare or calibration left without a usable
    /// reading and with no batch to wait for is abandoned.
    fn finish_batch(&mut self, now: Instant) -> Vec<ProtocolOutput> {
        self.expectations.pop_front();
        self.window.clear();
        self.continue_reading(now);
        if self.phase == CalibrationPhase::Idle || self.readings_outstanding() {
            return Vec::new();
        }
        let correlation = match std::mem::replace(&mut self.phase, CalibrationPhase::Idle) {
            CalibrationPhase::AwaitingZero { correlation }
            | CalibrationPhase::AwaitingLoad { correlation, .. } => correlation,
            CalibrationPhase::Idle => None,
        };
        vec![self.error(
            ErrorClass::Protocol,
            "calibration abandoned: no valid reading in batch",
            None,
            correlation,
        )]
    }

    fn consume_bad_reading(&mut self, reason: impl Into<String>, now: Instant) -> Vec<ProtocolOutput> {
        let (correlation, last) = self.count_reading(now);
        let mut outputs = vec![self.error(ErrorClass::Protocol, reason, None, correlation)];
        if last {
            outputs.extend(self.finish_batch(now));
        }
        outputs
    }

    fn stop_measuring(&mut self) {
        let before = self.expectations.len();
        self.expectations
            .retain(|o| !matches!(o.expectation, Expectation::Readings { .. }));
        self.outgoing.clear();
        self.window.clear();
        if self.phase != CalibrationPhase::Idle {
            warn!(device = %self.name, "Calibration abandoned: measuring stopped");
            self.phase = CalibrationPhase::Idle;
        }
        debug!(
            device = %self.name,
            dropped = before - self.expectations.len(),
            "Balance stopped measuring"
        );
    }

    fn continue_reading(&mut self, now: Instant) {
        if self.settings.read_continuously && !self.hardware_fault && !self.readings_outstanding()
        {
            let bytes = self.request_readings(self.settings.readings_per_request, None, now);
            self.outgoing.push_back(bytes);
        }
    }

    /// Pop the front expectation as answered by garbage. A dropped batch
    /// also drops the stability window and any pending calibration.
    fn abandon_front(&mut self) -> Option<String> {
        let outstanding = self.expectations.pop_front()?;
        if matches!(outstanding.expectation, Expectation::Readings { .. }) {
            self.window.clear();
            if self.phase != CalibrationPhase::Idle {
                warn!(device = %self.name, "Calibration abandoned: reading batch failed");
                self.phase = CalibrationPhase::Idle;
            }
        }
        outstanding.correlation
    }

    fn consume_reply(&mut self, reply: &str, now: Instant) -> Vec<ProtocolOutput> {
        if reply == BALANCE_REPLY_UNKNOWN && !self.batch_in_front() {
            let command = self.expectations.front().map(|o| o.expectation.command());
            let correlation = self.abandon_front();
            let reason = match command {
                Some(command) => format!("unrecognized command {}", command),
                None => "unrecognized command".to_string(),
            };
            return vec![self.error(ErrorClass::Protocol, reason, None, correlation)];
        }

        let Some(front) = self.expectations.front() else {
            if reply.parse::<i64>().is_ok() {
                debug!(device = %self.name, reply = %reply, "Dropping stray reading");
                return Vec::new();
            }
            return vec![self.error(
                ErrorClass::Protocol,
                format!("unexpected reply {:?}", reply),
                None,
                None,
            )];
        };

        let expectation = front.expectation;
        match expectation {
            Expectation::Status => {
                let correlation = self.abandon_front();
                self.consume_status(reply, correlation)
            }
            Expectation::Identity => {
                self.abandon_front();
                info!(device = %self.name, identity = %reply, "Balance identified");
                self.identity = Some(reply.to_string());
                Vec::new()
            }
            Expectation::Ack(command) => {
                let correlation = self.abandon_front();
                if reply == BALANCE_REPLY_OK {
                    debug!(device = %self.name, "Balance acknowledged {}", command);
                    Vec::new()
                } else {
                    vec![self.error(
                        ErrorClass::Protocol,
                        format!("unexpected reply {:?} to {}", reply, command),
                        None,
                        correlation,
                    )]
                }
            }
            Expectation::Readings { .. } => {
                let Ok(raw) = reply.parse::<i64>() else {
                    let reason = if reply == BALANCE_REPLY_UNKNOWN {
                        format!("unrecognized command {}", BALANCE_CMD_READINGS)
                    } else {
                        format!("malformed reading {:?}", reply)
                    };
                    return self.consume_bad_reading(reason, now);
                };
                let (correlation, last) = self.count_reading(now);
                let mut outputs = self.consume_reading(raw, correlation);
                if last {
                    outputs.extend(self.finish_batch(now));
                }
                outputs
            }
        }
    }

    fn consume_status(&mut self, reply: &str, correlation: Option<String>) -> Vec<ProtocolOutput> {
        let Ok(code) = reply.parse::<u16>() else {
            return vec![self.error(
                ErrorClass::Protocol,
                format!("malformed status reply {:?}", reply),
                None,
                correlation,
            )];
        };
        if code == 0 {
            debug!(device = %self.name, "Balance status OK");
            return Vec::new();
        }

        let mut faults = Vec::new();
        if code & BALANCE_STATUS_COMMAND_ERROR != 0 {
            faults.push("command error");
        }
        if code & BALANCE_STATUS_EXECUTION_ERROR != 0 {
            faults.push("execution error");
        }
        if code & BALANCE_STATUS_HARDWARE_ERROR != 0 {
            faults.push("hardware error");
            self.hardware_fault = true;
            self.outgoing.clear();
        }
        if faults.is_empty() {
            faults.push("unknown status");
        }
        vec![self.error(
            ErrorClass::Device,
            format!("balance status: {}", faults.join(", ")),
            Some(reply.to_string()),
            correlation,
        )]
    }

    fn consume_reading(&mut self, raw: i64, correlation: Option<String>) -> Vec<ProtocolOutput> {
        match std::mem::replace(&mut self.phase, CalibrationPhase::Idle) {
            CalibrationPhase::AwaitingZero { correlation } => {
                self.calibration = self.calibration.tared(raw);
                self.window.clear();
                info!(device = %self.name, zero_offset = raw, "Balance tared");
                vec![ProtocolOutput::correlated(
                    EventPayload::calibration(self.calibration),
                    correlation,
                )]
            }
            CalibrationPhase::AwaitingLoad {
                known_mass,
                correlation,
            } => {
                self.window.clear();
                match self.calibration.calibrated(raw, known_mass) {
                    Ok(calibration) => {
                        self.calibration = calibration;
                        info!(
                            device = %self.name,
                            zero_offset = calibration.zero_offset,
                            gain = ?calibration.gain,
                            "Balance calibrated"
                        );
                        vec![ProtocolOutput::correlated(
                            EventPayload::calibration(calibration),
                            correlation,
                        )]
                    }
                    Err(e) => vec![self.error(ErrorClass::Protocol, e.to_string(), None, correlation)],
                }
            }
            CalibrationPhase::Idle => {
                let Some(grams) = self.calibration.mass(raw) else {
                    debug!(device = %self.name, raw, "Balance uncalibrated; dropping reading");
                    return Vec::new();
                };
                while self.window.len() >= self.settings.stability_window {
                    self.window.pop_front();
                }
                self.window.push_back(grams);
                let stable = self.is_stable();
                vec![ProtocolOutput::correlated(
                    EventPayload::MassReading { grams, raw, stable },
                    correlation,
                )]
            }
        }
    }

    fn is_stable(&self) -> bool {
        if self.window.len() < self.settings.stability_window {
            return false;
        }
        let (min, max) = self
            .window
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), m| {
                (lo.min(*m), hi.max(*m))
            });
        max - min <= self.settings.stability_tolerance
            && self.window.back().is_some_and(|m| *m >= self.settings.min_mass)
    }

    fn error(
        &self,
        class: ErrorClass,
        reason: impl Into<String>,
        code: Option<String>,
        correlation: Option<String>,
    ) -> ProtocolOutput {
        let reason = reason.into();
        warn!(device = %self.name, class = %class, reason = %reason, "Balance error");
        ProtocolOutput::correlated(
            EventPayload::DeviceError {
                class,
                reason,
                code,
            },
            correlation,
        )
    }
}

fn command_bytes(command: &str) -> Bytes {
    let mut bytes = Vec::with_capacity(command.len() + 1);
    bytes.extend_from_slice(command.as_bytes());
    bytes.push(BALANCE_TERMINATOR);
    Bytes::from(bytes)
}
