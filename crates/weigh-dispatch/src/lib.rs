//! Event Sink Dispatcher.
//!
//! Delivers every coordinated event to the storage sink and the network
//! sink independently. Storage is lossless: failed writes are retried and
//! a full queue applies backpressure to ingestion, announced with a
//! `SinkOverloaded` event on the network path. The network path is
//! best-effort and drops its oldest events rather than block.
//!
//! # Example
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use weigh_core::{EventSink, ProtocolEvent};
//! use weigh_dispatch::{Dispatcher, DispatcherConfig};
//!
//! async fn run<S: EventSink, N: EventSink>(
//!     events: mpsc::Receiver<ProtocolEvent>,
//!     storage: S,
//!     network: N,
//! ) {
//!     let dispatcher = Dispatcher::spawn(events, storage, network, DispatcherConfig::default());
//!     let stats = dispatcher.shutdown().await;
//!     println!("stored {} events", stats.storage.delivered);
//! }
//! ```

pub mod dispatcher;
pub mod stats;

pub use dispatcher::{DISPATCHER_DEVICE, Dispatcher, DispatcherConfig};
pub use stats::{DispatcherStats, SinkStats};
