//! Integration tests for TcpEventSink against a loopback listener.

use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use weigh_core::{EventPayload, EventSink, ProtocolEvent, ProtocolOutput};
use weigh_network::{TcpEventSink, TcpSinkConfig, TcpSinkError};

fn tag_event(sequence: u64) -> ProtocolEvent {
    ProtocolEvent::new(
        "rfid-1",
        sequence,
        Utc::now(),
        ProtocolOutput::new(EventPayload::TagDetected {
            code: 982_000_000_000_000 + sequence,
            raw: format!("Z{:016X}", sequence),
        }),
    )
}

#[tokio::test]
async fn test_events_arrive_as_json_lines_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = FramedRead::new(stream, LinesCodec::new());
        let mut received = Vec::new();
        while received.len() < 3 {
            received.push(lines.next().await.unwrap().unwrap());
        }
        received
    });

    let mut sink = TcpEventSink::new(TcpSinkConfig::new(addr).prefix("weigh:"));
    let sent: Vec<ProtocolEvent> = (1..=3).map(tag_event).collect();
    for event in &sent {
        sink.deliver(event).await.unwrap();
    }
    sink.flush().await.unwrap();
    assert!(sink.is_connected());

    let received = server.await.unwrap();
    let decoded: Vec<ProtocolEvent> = received
        .iter()
        .map(|line| {
            let json = line.strip_prefix("weigh:").unwrap();
            serde_json::from_str(json).unwrap()
        })
        .collect();
    assert_eq!(decoded, sent);

    sink.close().await.unwrap();
    assert!(!sink.is_connected());
}

#[tokio::test]
async fn test_unreachable_client_backs_off() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = TcpSinkConfig::new(addr)
        .timeout(Duration::from_millis(500))
        .backoff(Duration::from_secs(10), Duration::from_secs(60));
    let mut sink = TcpEventSink::new(config);

    let first = sink.send(&tag_event(1)).await;
    assert!(matches!(first, Err(TcpSinkError::Io(_))), "{:?}", first);
    assert_eq!(sink.failed_attempts(), 1);

    // The retry is not due yet: fail fast without another attempt.
    let second = sink.send(&tag_event(2)).await;
    assert!(matches!(second, Err(TcpSinkError::Backoff { .. })), "{:?}", second);
    assert_eq!(sink.failed_attempts(), 1);

    let error: weigh_core::Error = second.unwrap_err().into();
    assert!(matches!(error, weigh_core::Error::Sink { ref sink, .. } if sink == "network"));
}

#[tokio::test]
async fn test_reconnects_after_client_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(usize, String)>();

    tokio::spawn(async move {
        for connection in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = FramedRead::new(stream, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                let _ = seen_tx.send((connection, line));
                if connection == 0 {
                    // Hang up after the first event.
                    break;
                }
            }
        }
    });

    let config = TcpSinkConfig::new(addr)
        .timeout(Duration::from_millis(500))
        .backoff(Duration::from_millis(10), Duration::from_millis(50));
    let mut sink = TcpEventSink::new(config);

    let reconnected = tokio::time::timeout(Duration::from_secs(10), async {
        let mut sequence = 0;
        loop {
            sequence += 1;
            // Failures are expected while the old connection dies.
            let _ = sink.send(&tag_event(sequence)).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            while let Ok((connection, line)) = seen_rx.try_recv() {
                if connection == 1 {
                    return line;
                }
            }
        }
    })
    .await
    .expect("sink never reached the restarted client");

    let event: ProtocolEvent = serde_json::from_str(&reconnected).unwrap();
    assert_eq!(event.device, "rfid-1");
    assert!(sink.is_connected());
    assert_eq!(sink.failed_attempts(), 0);
}
