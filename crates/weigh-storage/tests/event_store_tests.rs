//! Event log integration tests against an in-memory SQLite database.
//!
//! Run with: cargo test --package weigh-storage --test event_store_tests

use chrono::{TimeZone, Utc};
use rstest::rstest;

use weigh_core::{
    CalibrationState, ErrorClass, EventPayload, EventSink, ProtocolEvent, ProtocolOutput,
};
use weigh_storage::{Database, DatabaseConfig, SqliteEventStore};

fn event(device: &str, sequence: u64, payload: EventPayload) -> ProtocolEvent {
    let timestamp = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()
        + chrono::Duration::milliseconds(sequence as i64);
    ProtocolEvent::new(device, sequence, timestamp, ProtocolOutput::new(payload))
}

async fn store() -> (Database, SqliteEventStore) {
    let db = Database::in_memory().await.unwrap();
    let store = SqliteEventStore::new(&db);
    (db, store)
}

#[tokio::test]
async fn test_append_and_read_back() {
    let (db, store) = store().await;

    let tag = event(
        "rfid-1",
        1,
        EventPayload::TagDetected {
            code: 982_000_123_456_789,
            raw: "Z0123456789ABCDEF".to_string(),
        },
    );
    let mut error = event(
        "rfid-1",
        2,
        EventPayload::DeviceError {
            class: ErrorClass::Device,
            reason: "status fault".to_string(),
            code: Some("008".to_string()),
        },
    );
    error.correlation = Some("req-7".to_string());

    let first = store.append(&tag).await.unwrap();
    let second = store.append(&error).await.unwrap();
    assert!(second > first);

    let rows = store.recent("rfid-1", 10).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].kind, "device_error");
    assert_eq!(rows[0].correlation.as_deref(), Some("req-7"));
    assert_eq!(rows[0].to_event().unwrap(), error);
    assert_eq!(rows[1].to_event().unwrap(), tag);

    db.close().await;
}

#[tokio::test]
async fn test_recent_is_scoped_and_limited() {
    let (_db, store) = store().await;

    for sequence in 1..=5 {
        store
            .append(&event("rfid-1", sequence, EventPayload::DeviceConnected))
            .await
            .unwrap();
    }
    store
        .append(&event("rfid-2", 1, EventPayload::DeviceConnected))
        .await
        .unwrap();

    let rows = store.recent("rfid-1", 3).await.unwrap();
    let sequences: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![5, 4, 3]);
    assert!(store.recent("balance-9", 3).await.unwrap().is_empty());
    assert_eq!(store.count().await.unwrap(), 6);
    assert_eq!(store.count_by_kind("device_connected").await.unwrap(), 6);
}

#[rstest]
#[case("UPDATE device_events SET device = 'other'")]
#[case("DELETE FROM device_events")]
#[tokio::test]
async fn test_events_are_append_only(#[case] statement: &str) {
    let (db, store) = store().await;
    store
        .append(&event("rfid-1", 1, EventPayload::DeviceConnected))
        .await
        .unwrap();

    let result = sqlx::query(statement).execute(db.pool()).await;
    let message = result.unwrap_err().to_string();
    assert!(message.contains("append-only"), "{}", message);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_latest_calibrations_per_balance() {
    let (_db, store) = store().await;

    let changes = [
        ("balance-1", 1, CalibrationState::new(100, None)),
        ("balance-2", 1, CalibrationState::new(40, Some(0.5))),
        ("balance-1", 2, CalibrationState::new(100, Some(0.25))),
    ];
    for (device, sequence, calibration) in changes {
        store
            .append(&event(
                device,
                sequence,
                EventPayload::calibration(calibration),
            ))
            .await
            .unwrap();
    }
    store
        .append(&event(
            "balance-1",
            3,
            EventPayload::MassReading {
                grams: 200.0,
                raw: 900,
                stable: true,
            },
        ))
        .await
        .unwrap();

    let latest = store.latest_calibrations().await.unwrap();
    assert_eq!(
        latest,
        vec![
            ("balance-1".to_string(), CalibrationState::new(100, Some(0.25))),
            ("balance-2".to_string(), CalibrationState::new(40, Some(0.5))),
        ]
    );
}

#[tokio::test]
async fn test_store_as_event_sink() {
    let (_db, mut store) = store().await;
    assert_eq!(store.name(), "storage");

    store
        .deliver(&event(
            "balance-1",
            1,
            EventPayload::DeviceDisconnected {
                reason: Some("port closed".to_string()),
            },
        ))
        .await
        .unwrap();
    store.flush().await.unwrap();

    assert_eq!(store.count_by_kind("device_disconnected").await.unwrap(), 1);
}

#[tokio::test]
async fn test_file_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("weigh.db");
    let path = path.to_string_lossy().to_string();

    let db = Database::new(DatabaseConfig::new(path.clone())).await.unwrap();
    SqliteEventStore::new(&db)
        .append(&event(
            "balance-1",
            1,
            EventPayload::calibration(CalibrationState::new(12, Some(2.0))),
        ))
        .await
        .unwrap();
    db.close().await;

    let db = Database::new(DatabaseConfig::new(path)).await.unwrap();
    db.health_check().await.unwrap();
    let latest = SqliteEventStore::new(&db).latest_calibrations().await.unwrap();
    assert_eq!(
        latest,
        vec![("balance-1".to_string(), CalibrationState::new(12, Some(2.0)))]
    );
    db.close().await;
}
