//! Network delivery of device events.
//!
//! The only component here is [`TcpEventSink`], which forwards every event
//! as one line of JSON over a persistent TCP connection to a real-time
//! client. Delivery is best-effort: an event that cannot be written is
//! reported to the caller and not retried, and the connection is
//! re-established with capped backoff on later deliveries.
//!
//! # Example
//!
//! ```no_run
//! use weigh_network::{TcpEventSink, TcpSinkConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TcpSinkConfig::new("127.0.0.1:3233".parse()?).prefix("weigh:");
//! let mut sink = TcpEventSink::new(config);
//! sink.connect().await?;
//! # Ok(())
//! # }
//! ```

mod sink;

pub use sink::{DEFAULT_PORT, TcpEventSink, TcpSinkConfig, TcpSinkError};
