//! Line transport: one open port, framed into protocol units.
//!
//! A transport holds no business state. It reads units through the
//! device's codec, writes raw bytes, and watches two deadlines:
//!
//! - the partial-frame deadline of the balance codec: a partial frame left
//!   idle too long is discarded;
//! - the liveness deadline: after a quiet period the port is probed, and a
//!   failed probe is a transport error.
//!
//! Both are independent of protocol response timeouts, which belong to the
//! state machine.

#![allow(async_fn_in_trait)]

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use weigh_core::{DeviceConfig, Error, Result};
use weigh_protocol::{DeviceCodec, DeviceProtocol, ProtocolUnit};

use crate::devices::AnyTransport;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Operations every transport supports.
pub trait Transport {
    /// OS identifier of the port.
    fn port(&self) -> &str;

    /// Wait for the next unit. Cancel-safe: dropping the future loses no
    /// data.
    async fn read_frame(&mut self) -> Result<ProtocolUnit>;

    /// Write bytes exactly as given.
    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush and release the port. Idempotent.
    async fn close(&mut self);
}

/// Opens transports for device configs.
pub trait Connector {
    async fn open(&self, config: &DeviceConfig) -> Result<AnyTransport>;
}

/// Byte stream underneath a [`LineTransport`].
pub trait PortIo: AsyncRead + AsyncWrite + Unpin + Send {
    /// Cheap check that the OS still considers the port usable.
    fn probe(&self) -> io::Result<()>;
}

/// A [`Transport`] over any [`PortIo`], framed with the device codec.
pub struct LineTransport<P: PortIo> {
    framed: Framed<P, DeviceCodec>,
    port: String,
    liveness: Duration,
    liveness_deadline: Instant,
    closed: bool,
}

impl<P: PortIo> LineTransport<P> {
    /// Wrap an already opened port.
    pub fn new(io: P, config: &DeviceConfig) -> Self {
        let liveness = config.timeouts.liveness;
        Self {
            framed: Framed::new(io, DeviceProtocol::codec_for(config)),
            port: config.serial.port.clone(),
            liveness,
            liveness_deadline: Instant::now() + liveness,
            closed: false,
        }
    }

    pub fn get_ref(&self) -> &P {
        self.framed.get_ref()
    }

    fn touch(&mut self) {
        self.liveness_deadline = Instant::now() + self.liveness;
    }
}

impl<P: PortIo> std::fmt::Debug for LineTransport<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineTransport")
            .field("port", &self.port)
            .field("codec", self.framed.codec())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<P: PortIo> Transport for LineTransport<P> {
    fn port(&self) -> &str {
        &self.port
    }

    async fn read_frame(&mut self) -> Result<ProtocolUnit> {
        if self.closed {
            return Err(Error::transport(&self.port, "transport closed"));
        }
        loop {
            let partial_deadline = self.framed.codec().partial_deadline();
            tokio::select! {
                item = self.framed.next() => {
                    return match item {
                        Some(Ok(unit)) => {
                            self.touch();
                            Ok(unit)
                        }
                        Some(Err(e)) => Err(Error::transport(&self.port, e.to_string())),
                        None => Err(Error::transport(&self.port, "port closed")),
                    };
                }
                _ = sleep_until(partial_deadline.unwrap_or(self.liveness_deadline)),
                    if partial_deadline.is_some() =>
                {
                    let discarded = self.framed.codec_mut().discard_partial();
                    warn!(port = %self.port, discarded, "Discarding stale partial frame");
                }
                _ = sleep_until(self.liveness_deadline) => {
                    self.framed.get_ref().probe().map_err(|e| {
                        Error::transport(&self.port, format!("liveness probe failed: {}", e))
                    })?;
                    debug!(port = %self.port, "Line quiet; port healthy");
                    self.touch();
                }
            }
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.closed {
            return Err(Error::transport(&self.port, "transport closed"));
        }
        self.framed
            .send(Bytes::copy_from_slice(bytes))
            .await
            .map_err(|e| Error::transport(&self.port, e.to_string()))?;
        debug!(port = %self.port, bytes = ?String::from_utf8_lossy(bytes), "Sent");
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match timeout(CLOSE_TIMEOUT, self.framed.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(port = %self.port, error = %e, "Error while closing port"),
            Err(_) => warn!(port = %self.port, "Timed out flushing port on close"),
        }
        info!(port = %self.port, "Closed port");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use rstest::rstest;
    use weigh_core::DeviceConfig;

    async fn open(config: &DeviceConfig) -> (AnyTransport, crate::mock::MockLink) {
        let connector = MockConnector::new();
        let mut device = connector.device(&config.serial.port);
        let transport = connector.open(config).await.unwrap();
        let link = device.next_link().await.unwrap();
        (transport, link)
    }

    #[tokio::test]
    async fn test_reader_yields_each_character() {
        let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");
        let (mut transport, mut link) = open(&config).await;

        link.send(b"Z1").await.unwrap();
        assert_eq!(transport.read_frame().await.unwrap(), ProtocolUnit::Char(b'Z'));
        assert_eq!(transport.read_frame().await.unwrap(), ProtocolUnit::Char(b'1'));
    }

    #[rstest]
    #[case::semicolon(b"MSV?3;" as &[u8], "MSV?3")]
    #[case::crlf(b" 123456\r\n", "123456")]
    #[case::bare_question_mark(b"?", "?")]
    #[tokio::test]
    async fn test_balance_frames(#[case] input: &[u8], #[case] expected: &str) {
        let config = DeviceConfig::balance("balance-1", "/dev/ttyUSB1");
        let (mut transport, mut link) = open(&config).await;

        link.send(input).await.unwrap();
        assert_eq!(
            transport.read_frame().await.unwrap(),
            ProtocolUnit::Frame(expected.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_partial_frame_is_discarded() {
        let config = DeviceConfig::balance("balance-1", "/dev/ttyUSB1");
        let (mut transport, mut link) = open(&config).await;

        link.send(b"123").await.unwrap();
        assert!(
            timeout(Duration::from_secs(1), transport.read_frame())
                .await
                .is_err()
        );

        link.send(b"456;").await.unwrap();
        assert_eq!(
            transport.read_frame().await.unwrap(),
            ProtocolUnit::Frame("456".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_healthy_line_keeps_waiting() {
        let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");
        let (mut transport, mut link) = open(&config).await;

        // Several liveness periods pass without data.
        assert!(
            timeout(config.timeouts.liveness * 3, transport.read_frame())
                .await
                .is_err()
        );

        link.send(b"c").await.unwrap();
        assert_eq!(transport.read_frame().await.unwrap(), ProtocolUnit::Char(b'c'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_is_transport_error() {
        let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");
        let (mut transport, link) = open(&config).await;

        link.fail_probe();
        let error = transport.read_frame().await.unwrap_err();
        assert!(error.is_transport_failure());
        assert!(error.to_string().contains("liveness probe failed"));
    }

    #[tokio::test]
    async fn test_unplug_is_transport_error() {
        let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");
        let (mut transport, link) = open(&config).await;

        link.disconnect();
        let error = transport.read_frame().await.unwrap_err();
        assert!(matches!(error, Error::Transport { ref message, .. } if message == "port closed"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");
        let (mut transport, _link) = open(&config).await;

        transport.write_raw(b"").await.unwrap();
        transport.close().await;
        transport.close().await;
        assert!(transport.write_raw(b"p").await.is_err());
        assert!(transport.read_frame().await.is_err());
    }
}
