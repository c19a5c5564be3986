//! Append-only event log.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use weigh_core::{CalibrationState, EventPayload, EventSink, ProtocolEvent};

use crate::connection::Database;
use crate::error::{StorageError, StorageResult};

/// One row of `device_events`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub device: String,
    pub sequence: i64,
    pub kind: String,
    /// JSON encoding of the [`EventPayload`].
    pub payload: String,
    pub correlation: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StoredEvent {
    /// Decode the row back into the event that produced it.
    pub fn to_event(&self) -> StorageResult<ProtocolEvent> {
        let payload: EventPayload = serde_json::from_str(&self.payload)?;
        let sequence = u64::try_from(self.sequence).map_err(|_| StorageError::Corrupt {
            id: self.id,
            reason: format!("negative sequence {}", self.sequence),
        })?;
        Ok(ProtocolEvent {
            device: self.device.clone(),
            sequence,
            timestamp: self.timestamp,
            correlation: self.correlation.clone(),
            payload,
        })
    }
}

/// SQLite-backed event log; also the storage [`EventSink`].
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Append one event, returning its row id.
    pub async fn append(&self, event: &ProtocolEvent) -> StorageResult<i64> {
        let payload = serde_json::to_string(&event.payload)?;
        let sequence = i64::try_from(event.sequence).map_err(|_| {
            StorageError::Configuration(format!("sequence {} out of range", event.sequence))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO device_events (device, sequence, kind, payload, correlation, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.device)
        .bind(sequence)
        .bind(event.kind().as_str())
        .bind(payload)
        .bind(&event.correlation)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent events of one device, newest first.
    pub async fn recent(&self, device: &str, limit: i64) -> StorageResult<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(
            r#"
            SELECT id, device, sequence, kind, payload, correlation, timestamp
            FROM device_events
            WHERE device = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(device)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Number of stored events of the given kind (e.g. `"tag_detected"`).
    pub async fn count_by_kind(&self, kind: &str) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM device_events WHERE kind = ?")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count(&self) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM device_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// The last recorded calibration of every balance, by device name.
    pub async fn latest_calibrations(&self) -> StorageResult<Vec<(String, CalibrationState)>> {
        let rows = sqlx::query_as::<_, StoredEvent>(
            r#"
            SELECT e.id, e.device, e.sequence, e.kind, e.payload, e.correlation, e.timestamp
            FROM device_events e
            JOIN (
                SELECT device, MAX(id) AS id
                FROM device_events
                WHERE kind = 'calibration_changed'
                GROUP BY device
            ) latest ON latest.id = e.id
            ORDER BY e.device
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload: EventPayload = serde_json::from_str(&row.payload)?;
                let calibration = payload.as_calibration().ok_or_else(|| StorageError::Corrupt {
                    id: row.id,
                    reason: format!("{} row without calibration", row.kind),
                })?;
                Ok((row.device.clone(), calibration))
            })
            .collect()
    }
}

impl EventSink for SqliteEventStore {
    fn name(&self) -> &str {
        "storage"
    }

    async fn deliver(&mut self, event: &ProtocolEvent) -> weigh_core::Result<()> {
        let id = self.append(event).await?;
        debug!(id, device = %event.device, sequence = event.sequence, "Stored event");
        Ok(())
    }
}
