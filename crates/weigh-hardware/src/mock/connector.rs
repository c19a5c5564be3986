//! A scripted stand-in for the OS serial layer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use weigh_core::{DeviceConfig, Error, Result};

use super::port::{MockLink, link};
use crate::devices::AnyTransport;
use crate::transport::{Connector, LineTransport};

#[derive(Debug)]
struct PortSlot {
    refusals: u32,
    opens: u32,
    links: mpsc::UnboundedSender<MockLink>,
}

type Ports = Arc<Mutex<HashMap<String, PortSlot>>>;

/// Connector over in-memory ports.
///
/// Opening a port nobody registered fails like a missing device node.
///
/// # Examples
///
/// ```
/// use weigh_core::DeviceConfig;
/// use weigh_hardware::mock::MockConnector;
/// use weigh_hardware::transport::{Connector, Transport};
///
/// #[tokio::main]
/// async fn main() -> weigh_core::Result<()> {
///     let connector = MockConnector::new();
///     let mut device = connector.device("/dev/ttyUSB0");
///
///     let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");
///     let mut transport = connector.open(&config).await?;
///     let mut link = device.next_link().await.unwrap();
///
///     transport.write_raw(b"x").await?;
///     assert_eq!(link.read_exact(1).await?, b"x");
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    ports: Ports,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `port` and return the handle that receives its links.
    ///
    /// Registering the same port again replaces the previous handle.
    pub fn device(&self, port: impl Into<String>) -> MockDevice {
        let port = port.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.ports.lock().insert(
            port.clone(),
            PortSlot {
                refusals: 0,
                opens: 0,
                links: tx,
            },
        );
        MockDevice {
            port,
            ports: self.ports.clone(),
            links: rx,
        }
    }
}

impl Connector for MockConnector {
    async fn open(&self, config: &DeviceConfig) -> Result<AnyTransport> {
        let port_name = &config.serial.port;
        let port = {
            let mut ports = self.ports.lock();
            let slot = ports
                .get_mut(port_name)
                .ok_or_else(|| Error::connection(port_name, "No such file or directory"))?;
            if slot.refusals > 0 {
                slot.refusals -= 1;
                return Err(Error::connection(port_name, "Device or resource busy"));
            }
            let (port, device_end) = link();
            slot.links
                .send(device_end)
                .map_err(|_| Error::connection(port_name, "No such device"))?;
            slot.opens += 1;
            port
        };

        info!(device = %config.name, serial = %config.serial, "Opened mock port");
        Ok(AnyTransport::Mock(LineTransport::new(port, config)))
    }
}

/// Test-side handle for one mock port.
#[derive(Debug)]
pub struct MockDevice {
    port: String,
    ports: Ports,
    links: mpsc::UnboundedReceiver<MockLink>,
}

impl MockDevice {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Wait for the host to open the port and return the device end.
    ///
    /// Returns `None` once the connector is gone.
    pub async fn next_link(&mut self) -> Option<MockLink> {
        self.links.recv().await
    }

    /// Fail the next `count` opens.
    pub fn refuse_opens(&self, count: u32) {
        if let Some(slot) = self.ports.lock().get_mut(&self.port) {
            slot.refusals = count;
        }
    }

    /// Successful opens so far.
    pub fn opens(&self) -> u32 {
        self.ports
            .lock()
            .get(&self.port)
            .map(|slot| slot.opens)
            .unwrap_or(0)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.links.close();
        let mut ports = self.ports.lock();
        // A newer handle for the same port keeps its slot.
        if ports.get(&self.port).is_some_and(|slot| slot.links.is_closed()) {
            ports.remove(&self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    #[tokio::test]
    async fn test_unregistered_port_fails() {
        let connector = MockConnector::new();
        let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");

        let error = connector.open(&config).await.unwrap_err();
        assert!(matches!(error, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_refused_opens_then_success() {
        let connector = MockConnector::new();
        let mut device = connector.device("/dev/ttyUSB0");
        let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");

        device.refuse_opens(2);
        assert!(connector.open(&config).await.is_err());
        assert!(connector.open(&config).await.is_err());
        assert_eq!(device.opens(), 0);

        let mut transport = connector.open(&config).await.unwrap();
        assert_eq!(device.opens(), 1);
        assert_eq!(transport.port(), "/dev/ttyUSB0");

        let mut link = device.next_link().await.unwrap();
        transport.write_raw(b"c").await.unwrap();
        assert_eq!(link.read_exact(1).await.unwrap(), b"c");
    }

    #[tokio::test]
    async fn test_dropped_device_unregisters_port() {
        let connector = MockConnector::new();
        let config = DeviceConfig::reader("rfid-1", "/dev/ttyUSB0");

        drop(connector.device("/dev/ttyUSB0"));
        assert!(connector.open(&config).await.is_err());
    }
}
