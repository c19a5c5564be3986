//! TCP sink sending newline-delimited JSON events.
//!
//! ```text
//! Dispatcher ──> TcpEventSink ───(TCP, one JSON object per line)───> client
//!                    │
//!                    └─> LinesCodec (framing), Backoff (reconnection)
//! ```
//!
//! The sink connects lazily on the first delivery. When the connection is
//! lost the failed event is reported and dropped; the next delivery tries
//! to reconnect, and further attempts are spaced by a capped exponential
//! backoff until one succeeds. Deliveries made while the backoff is
//! running fail fast with [`TcpSinkError::Backoff`] instead of waiting.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::SinkExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, trace, warn};

use weigh_core::constants::{DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX};
use weigh_core::{Backoff, EventSink, ProtocolEvent};

/// Default client port.
pub const DEFAULT_PORT: u16 = 3233;

/// Configuration for [`TcpEventSink`]
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use weigh_network::TcpSinkConfig;
///
/// let config = TcpSinkConfig::new("127.0.0.1:4000".parse().unwrap())
///     .timeout(Duration::from_secs(1))
///     .prefix("weigh:");
/// assert_eq!(config.prefix.as_deref(), Some("weigh:"));
/// ```
#[derive(Debug, Clone)]
pub struct TcpSinkConfig {
    /// Client address to connect to
    pub server_addr: SocketAddr,

    /// Timeout for connect, write and flush
    pub timeout: Duration,

    /// Text prepended to every line, if any
    pub prefix: Option<String>,

    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl TcpSinkConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }
}

impl Default for TcpSinkConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            timeout: Duration::from_millis(3000),
            prefix: None,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Errors that can occur while delivering to the network client
#[derive(Debug, Error)]
pub enum TcpSinkError {
    /// No connection and no attempt was made
    #[error("Not connected to client")]
    NotConnected,

    /// A reconnection attempt failed recently; retry is not yet due
    #[error("Reconnecting in {remaining_ms}ms")]
    Backoff { remaining_ms: u64 },

    /// Connection attempt timed out
    #[error("Connection timeout after {0}ms")]
    ConnectionTimeout(u64),

    /// Write or flush timed out
    #[error("Write timeout after {0}ms")]
    WriteTimeout(u64),

    /// Connection was lost during a write
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The event could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Low-level I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TcpSinkError> for weigh_core::Error {
    fn from(error: TcpSinkError) -> Self {
        weigh_core::Error::sink("network", error.to_string())
    }
}

/// Best-effort event forwarder over a persistent TCP connection.
pub struct TcpEventSink {
    config: TcpSinkConfig,
    framed: Option<Framed<TcpStream, LinesCodec>>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl TcpEventSink {
    /// Create a sink; no connection is made until [`connect`](Self::connect)
    /// or the first delivery.
    pub fn new(config: TcpSinkConfig) -> Self {
        debug!(addr = %config.server_addr, "Creating TCP event sink");
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self {
            config,
            framed: None,
            backoff,
            retry_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    /// Failed connection attempts since the last successful one.
    pub fn failed_attempts(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Connect to the configured client, replacing any existing connection.
    pub async fn connect(&mut self) -> Result<(), TcpSinkError> {
        let addr = self.config.server_addr;
        info!(%addr, "Connecting to event client");

        let stream = match tokio::time::timeout(self.config.timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(TcpSinkError::ConnectionTimeout(
                    self.config.timeout.as_millis() as u64,
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(%addr, "Failed to set TCP_NODELAY: {}", e);
        }

        self.framed = Some(Framed::new(stream, LinesCodec::new()));
        info!(%addr, "Connected to event client");
        Ok(())
    }

    /// Send one event as a JSON line.
    ///
    /// # Errors
    ///
    /// Fails if the event cannot be encoded, if no connection could be
    /// established, or if the write fails or times out. A failed write
    /// drops the connection so the next call reconnects.
    pub async fn send(&mut self, event: &ProtocolEvent) -> Result<(), TcpSinkError> {
        let line = self.encode(event)?;
        if self.framed.is_none() {
            self.reconnect().await?;
        }
        let framed = self.framed.as_mut().ok_or(TcpSinkError::NotConnected)?;

        trace!(device = %event.device, sequence = event.sequence, "Sending event");
        let result = match tokio::time::timeout(self.config.timeout, framed.send(line)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TcpSinkError::ConnectionLost(e.to_string())),
            Err(_) => Err(TcpSinkError::WriteTimeout(
                self.config.timeout.as_millis() as u64,
            )),
        };

        if let Err(e) = &result {
            warn!(addr = %self.config.server_addr, "Dropping event client connection: {}", e);
            self.framed = None;
        }
        result
    }

    /// Flush and shut down the connection. Idempotent.
    pub async fn close(&mut self) -> Result<(), TcpSinkError> {
        if let Some(mut framed) = self.framed.take() {
            info!(addr = %self.config.server_addr, "Closing event client connection");

            let grace = Duration::from_millis(500);
            match tokio::time::timeout(grace, SinkExt::<String>::flush(&mut framed)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error flushing during close: {}", e),
                Err(_) => warn!("Flush timeout during close ({}ms)", grace.as_millis()),
            }

            let mut stream = framed.into_inner();
            match tokio::time::timeout(grace, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error during shutdown: {}", e),
                Err(_) => warn!("Shutdown timeout during close ({}ms)", grace.as_millis()),
            }
        }
        Ok(())
    }

    fn encode(&self, event: &ProtocolEvent) -> Result<String, TcpSinkError> {
        let json = serde_json::to_string(event)?;
        Ok(match &self.config.prefix {
            Some(prefix) => format!("{}{}", prefix, json),
            None => json,
        })
    }

    async fn reconnect(&mut self) -> Result<(), TcpSinkError> {
        if let Some(at) = self.retry_at {
            let now = Instant::now();
            if now < at {
                return Err(TcpSinkError::Backoff {
                    remaining_ms: (at - now).as_millis() as u64,
                });
            }
        }

        match self.connect().await {
            Ok(()) => {
                self.backoff.reset();
                self.retry_at = None;
                Ok(())
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                self.retry_at = Some(Instant::now() + delay);
                warn!(
                    addr = %self.config.server_addr,
                    attempt = self.backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Event client unreachable: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for TcpEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpEventSink")
            .field("server_addr", &self.config.server_addr)
            .field("connected", &self.is_connected())
            .field("failed_attempts", &self.backoff.attempt())
            .finish()
    }
}

impl EventSink for TcpEventSink {
    fn name(&self) -> &str {
        "network"
    }

    async fn deliver(&mut self, event: &ProtocolEvent) -> weigh_core::Result<()> {
        self.send(event).await?;
        Ok(())
    }

    async fn flush(&mut self) -> weigh_core::Result<()> {
        if let Some(framed) = self.framed.as_mut() {
            match tokio::time::timeout(self.config.timeout, SinkExt::<String>::flush(framed)).await {
                Ok(result) => result.map_err(|e| TcpSinkError::ConnectionLost(e.to_string()))?,
                Err(_) => {
                    return Err(TcpSinkError::WriteTimeout(
                        self.config.timeout.as_millis() as u64,
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}
