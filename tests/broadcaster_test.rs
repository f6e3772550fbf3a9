//! Broadcaster handshake, fan-out and shutdown behavior against real
//! sockets.

mod common;

use common::TestClient;
use depthcast::network::{
    Broadcaster, BroadcasterConfig, ClientEvent, ClientMessage, ServerMessage,
};
use depthcast::stream::StreamKind;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn config(port: u16, identification_timeout: Duration) -> BroadcasterConfig {
    BroadcasterConfig {
        host: "127.0.0.1".to_string(),
        port,
        identification_timeout,
        max_frame_bytes: 1024 * 1024,
        server_version: "0.1.0-test".to_string(),
    }
}

async fn started(
    port: u16,
    identification_timeout: Duration,
) -> (Broadcaster, u16, mpsc::Receiver<ClientEvent>) {
    let (event_tx, event_rx) = mpsc::channel(64);
    let broadcaster = Broadcaster::new(config(port, identification_timeout), event_tx);
    let bound = broadcaster.start().await.expect("broadcaster starts");
    (broadcaster, bound, event_rx)
}

async fn wait_for_count(broadcaster: &Broadcaster, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broadcaster.client_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client count never reached {expected}"));
}

#[tokio::test]
async fn identification_timeout_closes_with_protocol_code() {
    let (broadcaster, port, mut event_rx) = started(0, Duration::from_millis(200)).await;

    let mut client = TestClient::connect(port).await;
    client.next_of_type("identify").await;
    // Say nothing and wait out the identification window.
    let goodbye = client.next_of_type("goodbye").await;
    assert_eq!(goodbye["code"], 1002);
    assert!(client.closed().await);

    assert_eq!(broadcaster.client_count().await, 0);
    // The subscriber never identified, so no disconnect event is emitted.
    assert!(event_rx.try_recv().is_err());
    broadcaster.stop().await;
}

#[tokio::test]
async fn non_identify_message_first_is_a_protocol_violation() {
    let (broadcaster, port, mut event_rx) = started(0, Duration::from_secs(5)).await;

    let mut client = TestClient::connect(port).await;
    client.next_of_type("identify").await;
    client
        .send(&ClientMessage::StartSensor {
            sensor_type: StreamKind::Depth,
        })
        .await;
    let goodbye = client.next_of_type("goodbye").await;
    assert_eq!(goodbye["code"], 1002);
    assert!(client.closed().await);

    assert_eq!(broadcaster.client_count().await, 0);
    assert!(event_rx.try_recv().is_err());
    broadcaster.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_every_identified_subscriber() {
    let (broadcaster, port, mut event_rx) = started(0, Duration::from_secs(5)).await;

    let mut clients = Vec::new();
    for i in 0..3 {
        let mut client = TestClient::connect(port).await;
        let welcome = client.identify(&format!("viewer-{i}")).await;
        assert_eq!(welcome["serverVersion"], "0.1.0-test");
        assert!(welcome["sessionId"].as_str().is_some());
        clients.push(client);
    }
    wait_for_count(&broadcaster, 3).await;

    let delivered = broadcaster
        .broadcast(&ServerMessage::Status {
            status: json!({ "data": "Hello World" }),
        })
        .await;
    assert_eq!(delivered, 3);

    let mut received = Vec::new();
    for client in &mut clients {
        received.push(client.next_of_type("status").await);
    }
    assert!(received.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(received[0]["status"]["data"], "Hello World");

    // Three identified connections produced three connect events.
    let mut connects = 0;
    while connects < 3 {
        match tokio::time::timeout(Duration::from_secs(2), event_rx.recv()).await {
            Ok(Some(ClientEvent::Connected { .. })) => connects += 1,
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert_eq!(connects, 3);

    drop(clients);
    wait_for_count(&broadcaster, 0).await;
    broadcaster.stop().await;
}

#[tokio::test]
async fn unparseable_record_gets_error_but_keeps_connection() {
    let (broadcaster, port, _event_rx) = started(0, Duration::from_secs(5)).await;

    let mut client = TestClient::connect(port).await;
    client.identify("viewer").await;
    wait_for_count(&broadcaster, 1).await;

    client.send_raw(b"{ this is not json").await;
    let error = client.next_of_type("error").await;
    assert!(error["error"].as_str().unwrap().contains("unrecognized"));

    // Still identified and still receiving broadcasts.
    broadcaster
        .broadcast(&ServerMessage::Status {
            status: json!({ "alive": true }),
        })
        .await;
    let status = client.next_of_type("status").await;
    assert_eq!(status["status"]["alive"], true);
    broadcaster.stop().await;
}

#[tokio::test]
async fn port_conflict_moves_to_the_next_port() {
    // Occupy a port, then ask the broadcaster for the same one.
    let occupied = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind helper listener");
    let taken = occupied.local_addr().unwrap().port();

    let (broadcaster, bound, _event_rx) = started(taken, Duration::from_secs(5)).await;
    assert_ne!(bound, taken);
    assert!(bound > taken);

    // The shifted port accepts connections normally.
    let mut client = TestClient::connect(bound).await;
    client.identify("viewer").await;
    wait_for_count(&broadcaster, 1).await;
    broadcaster.stop().await;
}

#[tokio::test]
async fn stop_sends_normal_goodbye_and_is_idempotent() {
    let (broadcaster, port, _event_rx) = started(0, Duration::from_secs(5)).await;

    let mut client = TestClient::connect(port).await;
    client.identify("viewer").await;
    wait_for_count(&broadcaster, 1).await;

    broadcaster.stop().await;
    let goodbye = client.next_of_type("goodbye").await;
    assert_eq!(goodbye["code"], 1000);
    assert_eq!(goodbye["reason"], "Service shutting down");
    assert!(client.closed().await);

    // A second stop is a no-op.
    broadcaster.stop().await;
    assert_eq!(broadcaster.client_count().await, 0);
}
