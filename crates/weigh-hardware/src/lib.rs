//! Device sessions for serial RFID readers and weighing balances.
//!
//! This crate runs the live side of the system: it opens ports, drives the
//! protocol state machines from `weigh-protocol`, reconnects after
//! failures and merges every device's events into one stream.
//!
//! # Layers
//!
//! - [`transport`]: one open port framed into protocol units, with a
//!   liveness deadline ([`LineTransport`])
//! - [`serial`] and [`mock`]: real and in-memory connectors
//! - [`devices`]: enum dispatch over connectors and transports
//! - [`session`]: the per-device supervisor ([`SessionHandle`])
//! - [`manager`]: the multi-device coordinator ([`DeviceCoordinator`])
//!
//! # Async traits
//!
//! [`Transport`] and [`Connector`] use native `async fn` in traits
//! (edition 2024). They are not object-safe, so the session works with the
//! [`AnyTransport`] and [`AnyConnector`] enums instead of trait objects.
//!
//! # Testing without hardware
//!
//! ```
//! use std::sync::Arc;
//! use weigh_core::{DeviceConfig, EventPayload, MemoryCalibrationStore};
//! use weigh_hardware::mock::MockConnector;
//! use weigh_hardware::session::SessionHandle;
//!
//! #[tokio::main]
//! async fn main() {
//!     let connector = MockConnector::new();
//!     let mut device = connector.device("/dev/ttyUSB0");
//!
//!     let (mut session, mut events) = SessionHandle::start(
//!         DeviceConfig::reader("rfid-1", "/dev/ttyUSB0"),
//!         connector,
//!         Arc::new(MemoryCalibrationStore::new()),
//!         64,
//!     );
//!
//!     let mut link = device.next_link().await.unwrap();
//!     assert_eq!(events.recv().await.unwrap().payload, EventPayload::DeviceConnected);
//!     assert_eq!(link.read_exact(1).await.unwrap(), b"x");
//!
//!     session.stop().await;
//! }
//! ```

pub mod devices;
pub mod manager;
pub mod mock;
pub mod serial;
pub mod session;
pub mod transport;

pub use devices::{AnyConnector, AnyTransport};
pub use manager::{ConfigureReport, CoordinatorConfig, DeviceCoordinator, EventStream};
pub use serial::SerialConnector;
pub use session::{EventStamper, SessionContext, SessionHandle, SessionStatus};
pub use transport::{Connector, LineTransport, PortIo, Transport};
pub use weigh_core::{Backoff, retry_delay};
