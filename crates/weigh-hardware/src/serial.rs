//! Real serial ports via `tokio-serial`.

use std::io;

use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::info;

use weigh_core::{DeviceConfig, Error, Result, SerialSettings};

use crate::devices::AnyTransport;
use crate::transport::{Connector, LineTransport, PortIo};

impl PortIo for SerialStream {
    fn probe(&self) -> io::Result<()> {
        // Fails once the OS has torn the device down (e.g. USB unplug).
        self.bytes_to_read().map(|_| ()).map_err(io::Error::from)
    }
}

/// Opens OS serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl SerialConnector {
    pub fn new() -> Self {
        Self
    }

    fn open_stream(settings: &SerialSettings) -> Result<SerialStream> {
        let data_bits = match settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(Error::Config(format!("{}: unsupported data bits {}", settings.port, other)));
            }
        };
        let stop_bits = match settings.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(Error::Config(format!("{}: unsupported stop bits {}", settings.port, other)));
            }
        };
        let parity = match settings.parity {
            weigh_core::Parity::None => Parity::None,
            weigh_core::Parity::Even => Parity::Even,
            weigh_core::Parity::Odd => Parity::Odd,
        };
        let flow_control = match settings.flow_control {
            weigh_core::FlowControl::None => FlowControl::None,
            weigh_core::FlowControl::XonXoff => FlowControl::Software,
            weigh_core::FlowControl::RtsCts => FlowControl::Hardware,
        };

        tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| Error::connection(&settings.port, e.to_string()))
    }
}

impl Connector for SerialConnector {
    async fn open(&self, config: &DeviceConfig) -> Result<AnyTransport> {
        let stream = Self::open_stream(&config.serial)?;
        info!(device = %config.name, serial = %config.serial, "Opened serial port");
        Ok(AnyTransport::Serial(LineTransport::new(stream, config)))
    }
}
