use thiserror::Error;

/// Errors raised by the event store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection or query execution failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration execution failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A payload could not be encoded or a stored one decoded
    #[error("Payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored row violates the schema's expectations
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Specialized result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for weigh_core::Error {
    fn from(error: StorageError) -> Self {
        weigh_core::Error::sink("storage", error.to_string())
    }
}
