pub mod backoff;
pub mod constants;
pub mod error;
pub mod event;
pub mod sink;
pub mod types;

pub use backoff::{Backoff, retry_delay};
pub use error::{Error, ErrorClass, Result};
pub use event::{EventKind, EventPayload, ProtocolEvent, ProtocolOutput};
pub use sink::{CalibrationStore, EventSink, MemoryCalibrationStore};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
