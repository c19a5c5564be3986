//! Enum wrappers for transport dispatch.
//!
//! Native `async fn` in traits is not object-safe, so sessions hold an
//! [`AnyTransport`] and the coordinator an [`AnyConnector`] instead of trait
//! objects. Adding a transport means adding a variant here.

use tokio_serial::SerialStream;

use weigh_core::{DeviceConfig, Result};
use weigh_protocol::ProtocolUnit;

use crate::mock::{MockConnector, MockPort};
use crate::serial::SerialConnector;
use crate::transport::{Connector, LineTransport, Transport};

/// An open transport of any kind.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyTransport {
    Serial(LineTransport<SerialStream>),
    /// In-memory port driven by a [`MockDevice`](crate::mock::MockDevice).
    Mock(LineTransport<MockPort>),
}

impl Transport for AnyTransport {
    fn port(&self) -> &str {
        match self {
            Self::Serial(transport) => transport.port(),
            Self::Mock(transport) => transport.port(),
        }
    }

    async fn read_frame(&mut self) -> Result<ProtocolUnit> {
        match self {
            Self::Serial(transport) => transport.read_frame().await,
            Self::Mock(transport) => transport.read_frame().await,
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Serial(transport) => transport.write_raw(bytes).await,
            Self::Mock(transport) => transport.write_raw(bytes).await,
        }
    }

    async fn close(&mut self) {
        match self {
            Self::Serial(transport) => transport.close().await,
            Self::Mock(transport) => transport.close().await,
        }
    }
}

/// A connector of any kind.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AnyConnector {
    Serial(SerialConnector),
    Mock(MockConnector),
}

impl Connector for AnyConnector {
    async fn open(&self, config: &DeviceConfig) -> Result<AnyTransport> {
        match self {
            Self::Serial(connector) => connector.open(config).await,
            Self::Mock(connector) => connector.open(config).await,
        }
    }
}

impl From<SerialConnector> for AnyConnector {
    fn from(connector: SerialConnector) -> Self {
        Self::Serial(connector)
    }
}

impl From<MockConnector> for AnyConnector {
    fn from(connector: MockConnector) -> Self {
        Self::Mock(connector)
    }
}
