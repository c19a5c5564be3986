//! Durable storage for device events.
//!
//! Every event that leaves the session manager is appended to a single
//! SQLite table. Rows are never updated or deleted (triggers enforce it),
//! so the table doubles as the audit trail and as the source of the last
//! known calibration of each balance on startup.
//!
//! # Examples
//!
//! ```no_run
//! use weigh_storage::{Database, DatabaseConfig, SqliteEventStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(DatabaseConfig::new("weigh.db")).await?;
//! let store = SqliteEventStore::new(&db);
//!
//! for (device, calibration) in store.latest_calibrations().await? {
//!     println!("{}: zero {} gain {:?}", device, calibration.zero_offset, calibration.gain);
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod event_store;

pub use connection::{Database, DatabaseConfig};
pub use error::{StorageError, StorageResult};
pub use event_store::{SqliteEventStore, StoredEvent};
