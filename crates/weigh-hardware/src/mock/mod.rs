//! In-memory serial ports for testing and development.
//!
//! A [`MockConnector`] stands in for the OS: each configured port name gets
//! a [`MockDevice`] handle, and every successful open hands the device side
//! of a fresh in-memory link ([`MockLink`]) to that handle. Tests play the
//! instrument through the link.

pub mod connector;
pub mod port;

pub use connector::{MockConnector, MockDevice};
pub use port::{MockLink, MockPort};
