//! Device session supervisor.
//!
//! One supervisor task per device. It owns the connection attempt loop:
//!
//! ```text
//!            open ok                     transport error / panic
//! Connecting ───────► Connected ──────────────────────────────► Failed
//!     ▲                                                            │
//!     └──────────────────────── backoff ◄──────────────────────────┘
//! ```
//!
//! Every successful open gets a fresh transport and a fresh protocol state
//! machine; nothing but calibration survives a reconnection. Protocol
//! errors are reported as events and never end a session. A panic inside a
//! session is caught here and treated like a transport failure.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weigh_core::{
    Backoff, CalibrationStore, CommandRequest, DeviceConfig, Error, ErrorClass, EventPayload,
    ProtocolEvent, ProtocolOutput, Result, SessionState,
};
use weigh_protocol::{DeviceProtocol, ProtocolState, ProtocolUnit};

use crate::devices::{AnyConnector, AnyTransport};
use crate::transport::{Connector, Transport};

/// Default depth of a session's command queue.
pub const DEFAULT_COMMAND_CAPACITY: usize = 32;

/// Longest a stopping session waits for its stop commands to be written.
const STOP_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Assigns per-device sequence numbers and timestamps.
///
/// Shared between consecutive sessions of the same device so numbering
/// continues across reconnection and session replacement.
#[derive(Debug, Default)]
pub struct EventStamper {
    sequence: u64,
    last: Option<DateTime<Utc>>,
}

impl EventStamper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn a state machine output into an event.
    ///
    /// Timestamps never go backwards for one device, even if the wall clock
    /// does.
    pub fn stamp(&mut self, device: &str, output: ProtocolOutput) -> ProtocolEvent {
        self.sequence += 1;
        let now = Utc::now();
        let timestamp = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(timestamp);
        ProtocolEvent::new(device, self.sequence, timestamp, output)
    }

    /// Sequence number of the last stamped event.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Everything a supervisor needs from its owner.
#[derive(Clone)]
pub struct SessionContext {
    pub config: DeviceConfig,
    pub connector: AnyConnector,
    /// Merge point shared by all sessions.
    pub events: mpsc::Sender<ProtocolEvent>,
    pub calibrations: Arc<dyn CalibrationStore>,
    pub stamper: Arc<Mutex<EventStamper>>,
}

impl SessionContext {
    pub fn new(
        config: DeviceConfig,
        connector: impl Into<AnyConnector>,
        events: mpsc::Sender<ProtocolEvent>,
        calibrations: Arc<dyn CalibrationStore>,
    ) -> Self {
        Self {
            config,
            connector: connector.into(),
            events,
            calibrations,
            stamper: Arc::new(Mutex::new(EventStamper::new())),
        }
    }

    /// Share an existing stamper.
    pub fn with_stamper(mut self, stamper: Arc<Mutex<EventStamper>>) -> Self {
        self.stamper = stamper;
        self
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a session, always available without touching the device.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Protocol state while connected.
    pub protocol: Option<ProtocolState>,
    /// Failed attempts since the last successful open.
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            protocol: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Reject a command meant for the other device kind.
pub(crate) fn check_kind(config: &DeviceConfig, request: &CommandRequest) -> Result<()> {
    if request.command.kind() != config.kind {
        return Err(Error::command_rejected(
            &config.name,
            format!("{} command sent to a {}", request.command.kind(), config.kind),
        ));
    }
    Ok(())
}

/// Owner's handle on a running supervisor.
///
/// Dropping the handle cancels the session without waiting for it.
#[derive(Debug)]
pub struct SessionHandle {
    config: DeviceConfig,
    commands: mpsc::Sender<CommandRequest>,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Spawn a supervisor for `ctx.config`.
    pub fn spawn(ctx: SessionContext, command_capacity: usize) -> Self {
        let (command_tx, command_rx) = mpsc::channel(command_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let cancel = CancellationToken::new();
        let config = ctx.config.clone();
        let backoff = Backoff::new(config.timeouts.backoff_initial, config.timeouts.backoff_max);

        let supervisor = Supervisor {
            ctx,
            commands: command_rx,
            status: status_tx,
            cancel: cancel.clone(),
            backoff,
            connection_error_reported: false,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            config,
            commands: command_tx,
            status: status_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Start a standalone session with its own event channel.
    pub fn start(
        config: DeviceConfig,
        connector: impl Into<AnyConnector>,
        calibrations: Arc<dyn CalibrationStore>,
        event_capacity: usize,
    ) -> (Self, mpsc::Receiver<ProtocolEvent>) {
        let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));
        let ctx = SessionContext::new(config, connector, event_tx, calibrations);
        (Self::spawn(ctx, DEFAULT_COMMAND_CAPACITY), event_rx)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Queue a command without waiting for the device.
    ///
    /// # Errors
    ///
    /// - [`Error::CommandRejected`] for the wrong device kind or a full queue
    /// - [`Error::SessionStopped`] once the session has ended
    pub fn send_command(&self, request: CommandRequest) -> Result<()> {
        check_kind(&self.config, &request)?;
        self.commands.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::command_rejected(&self.config.name, "command queue full")
            }
            mpsc::error::TrySendError::Closed(_) => Error::SessionStopped(self.config.name.clone()),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Stop the session and wait until it has released the port.
    ///
    /// Interrupts a pending read. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(device = %self.config.name, error = %e, "Session task failed");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why a connected session ended.
enum Exit {
    /// Cancelled, or nobody is listening for events anymore.
    Stopped,
    Failed(Error),
}

/// What woke the connected loop.
enum Step {
    Stop,
    Command(CommandRequest),
    Unit(Result<ProtocolUnit>),
    Expire,
}

struct Supervisor {
    ctx: SessionContext,
    commands: mpsc::Receiver<CommandRequest>,
    status: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
    backoff: Backoff,
    /// One connection error per failure streak.
    connection_error_reported: bool,
}

impl Supervisor {
    fn name(&self) -> &str {
        &self.ctx.config.name
    }

    async fn run(mut self) {
        info!(device = %self.name(), kind = %self.ctx.config.kind, "Session started");

        while !self.cancel.is_cancelled() {
            self.publish(|status| {
                status.state = SessionState::Connecting;
                status.protocol = None;
            });

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.ctx.connector.open(&self.ctx.config) => opened,
            };

            let failure = match opened {
                Ok(transport) => {
                    self.backoff.reset();
                    self.connection_error_reported = false;
                    self.publish(|status| {
                        status.consecutive_failures = 0;
                        status.last_error = None;
                    });

                    let outcome = AssertUnwindSafe(self.run_connected(transport))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Exit::Stopped) => break,
                        Ok(Exit::Failed(error)) => {
                            warn!(device = %self.name(), error = %error, "Transport failed");
                            let reason = error.to_string();
                            if !self.emit(EventPayload::DeviceDisconnected {
                                reason: Some(reason.clone()),
                            })
                            .await
                            {
                                break;
                            }
                            reason
                        }
                        Err(panic) => {
                            let reason = format!("session panicked: {}", panic_message(&*panic));
                            error!(device = %self.name(), reason = %reason, "Recovered session panic");
                            if !self.emit(EventPayload::error(ErrorClass::Panic, reason.clone())).await
                                || !self
                                    .emit(EventPayload::DeviceDisconnected {
                                        reason: Some(reason.clone()),
                                    })
                                    .await
                            {
                                break;
                            }
                            reason
                        }
                    }
                }
                Err(error) => {
                    let reason = error.to_string();
                    if self.connection_error_reported {
                        debug!(device = %self.name(), error = %reason, "Port still unavailable");
                    } else {
                        warn!(device = %self.name(), error = %reason, "Cannot open port");
                        self.connection_error_reported = true;
                        if !self.emit(EventPayload::error(error.class(), reason.clone())).await {
                            break;
                        }
                    }
                    reason
                }
            };

            self.publish(|status| {
                status.state = SessionState::Failed;
                status.protocol = None;
                status.consecutive_failures += 1;
                status.last_error = Some(failure);
            });

            if !self.wait_backoff().await {
                break;
            }
        }

        self.publish(|status| {
            status.state = SessionState::Disconnected;
            status.protocol = None;
        });
        info!(device = %self.name(), "Session stopped");
    }

    async fn run_connected(&mut self, mut transport: AnyTransport) -> Exit {
        let stored = self.ctx.calibrations.load(self.name());
        let mut protocol = DeviceProtocol::for_config(&self.ctx.config, stored);

        if !self.emit(EventPayload::DeviceConnected).await {
            transport.close().await;
            return Exit::Stopped;
        }
        self.publish(|status| {
            status.state = SessionState::Connected;
            status.protocol = Some(protocol.state());
        });
        info!(device = %self.name(), port = %transport.port(), "Session connected");

        let exit = 'session: {
            for request in DeviceProtocol::start_sequence(&self.ctx.config) {
                if let Err(exit) = self.issue(&mut protocol, &mut transport, request).await {
                    break 'session exit;
                }
            }

            loop {
                while let Some(bytes) = protocol.take_outgoing() {
                    if let Err(error) = transport.write_raw(&bytes).await {
                        break 'session Exit::Failed(error);
                    }
                }
                let protocol_state = protocol.state();
                self.publish(|status| status.protocol = Some(protocol_state));

                let deadline = protocol.next_deadline();
                let step = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Step::Stop,
                    Some(request) = self.commands.recv() => Step::Command(request),
                    unit = transport.read_frame() => Step::Unit(unit),
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        Step::Expire
                    }
                };

                match step {
                    Step::Stop => {
                        self.send_stop_sequence(&mut protocol, &mut transport).await;
                        break 'session Exit::Stopped;
                    }
                    Step::Command(request) => {
                        if let Err(exit) = self.issue(&mut protocol, &mut transport, request).await {
                            break 'session exit;
                        }
                    }
                    Step::Unit(Ok(unit)) => {
                        let outputs = protocol.consume_frame(unit, Instant::now());
                        if !self.emit_outputs(outputs).await {
                            break 'session Exit::Stopped;
                        }
                    }
                    Step::Unit(Err(error)) => break 'session Exit::Failed(error),
                    Step::Expire => {
                        let outputs = protocol.expire(Instant::now());
                        if !self.emit_outputs(outputs).await {
                            break 'session Exit::Stopped;
                        }
                    }
                }
            }
        };

        transport.close().await;
        if let Some(calibration) = protocol.calibration() {
            self.ctx.calibrations.save(self.name(), calibration);
        }
        if matches!(exit, Exit::Stopped) {
            // Best effort; the receiver may already be gone.
            self.emit(EventPayload::DeviceDisconnected {
                reason: Some("stopped".to_string()),
            })
            .await;
        }
        exit
    }

    /// Issue one command. Rejections become events; write failures end the
    /// session.
    async fn issue(
        &mut self,
        protocol: &mut DeviceProtocol,
        transport: &mut AnyTransport,
        request: CommandRequest,
    ) -> std::result::Result<(), Exit> {
        let correlation = request.correlation.clone();
        debug!(device = %self.name(), command = ?request.command, "Issuing command");
        match protocol.issue(request, Instant::now()) {
            Ok(bytes) => transport.write_raw(&bytes).await.map_err(Exit::Failed),
            Err(error) => {
                warn!(device = %self.name(), error = %error, "Command rejected");
                let payload = EventPayload::error(error.class(), error.to_string());
                if self.emit_output(ProtocolOutput::correlated(payload, correlation)).await {
                    Ok(())
                } else {
                    Err(Exit::Stopped)
                }
            }
        }
    }

    /// Tell the device to stop before the port is released. Failures are
    /// only logged; the session is ending either way.
    async fn send_stop_sequence(&self, protocol: &mut DeviceProtocol, transport: &mut AnyTransport) {
        for request in DeviceProtocol::stop_sequence(&self.ctx.config) {
            let bytes = match protocol.issue(request, Instant::now()) {
                Ok(bytes) => bytes,
                Err(error) => {
                    debug!(device = %self.name(), error = %error, "Stop command not sent");
                    continue;
                }
            };
            match timeout(STOP_WRITE_TIMEOUT, transport.write_raw(&bytes)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    debug!(device = %self.name(), error = %error, "Stop command not sent");
                    return;
                }
                Err(_) => {
                    debug!(device = %self.name(), "Stop command write timed out");
                    return;
                }
            }
        }
    }

    /// Sleep before the next attempt, answering commands meanwhile.
    ///
    /// Returns `false` when cancelled.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        info!(
            device = %self.name(),
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after delay"
        );
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = sleep_until(deadline) => return true,
                Some(request) = self.commands.recv() => {
                    let payload = EventPayload::error(
                        ErrorClass::Caller,
                        format!("{:?} dropped: device not connected", request.command),
                    );
                    if !self.emit_output(ProtocolOutput::correlated(payload, request.correlation)).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn emit_outputs(&mut self, outputs: Vec<ProtocolOutput>) -> bool {
        for output in outputs {
            if let Some(calibration) = output.payload.as_calibration() {
                self.ctx.calibrations.save(self.name(), calibration);
            }
            if !self.emit_output(output).await {
                return false;
            }
        }
        true
    }

    async fn emit(&self, payload: EventPayload) -> bool {
        self.emit_output(ProtocolOutput::new(payload)).await
    }

    /// Stamp and send one event. Returns `false` once the receiver is gone.
    async fn emit_output(&self, output: ProtocolOutput) -> bool {
        let event = self.ctx.stamper.lock().stamp(self.name(), output);
        debug!(device = %self.name(), event = %event, "Event");
        if self.ctx.events.send(event).await.is_err() {
            debug!(device = %self.name(), "Event receiver closed");
            return false;
        }
        true
    }

    fn publish(&self, update: impl FnOnce(&mut SessionStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            update(status);
            *status != before
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
