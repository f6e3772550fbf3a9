//! End-to-end pipeline: mock camera through sensors and the supervisor out
//! to a real network subscriber.

mod common;

use common::TestClient;
use depthcast::config::Settings;
use depthcast::device::mock::MockCamera;
use depthcast::device::LedColor;
use depthcast::network::ClientMessage;
use depthcast::service;
use depthcast::stream::StreamKind;
use std::sync::Arc;
use std::time::Duration;

fn test_settings(port: u16) -> Settings {
    let mut settings = Settings::default();
    settings.network.websocket.port = port;
    settings.network.websocket.identification_timeout_ms = 2_000;
    settings.device.frame_interval_ms = 30;
    settings.sensors.color.enabled = false;
    settings.sensors.infrared.enabled = false;
    settings.debug.log_level = "warn".to_string();
    settings
}

async fn poll_until<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !probe().await {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn capture_to_broadcast_roundtrip() {
    let settings = test_settings(46211);
    let camera = MockCamera::new(&settings.device);
    let handle = service::launch(settings, Arc::new(camera.clone()))
        .await
        .expect("service launches");

    let mut client = TestClient::connect(handle.port()).await;
    let welcome = client.identify("integration-viewer").await;
    assert!(welcome["sessionId"].as_str().is_some());

    let info = client.next_of_type("deviceInfo").await;
    assert_eq!(info["info"]["depthWidth"], 512);
    assert_eq!(info["info"]["colorHeight"], 1080);
    client.next_of_type("status").await;

    // The first subscriber starts the enabled sensors; depth frames flow.
    let frame = loop {
        let frame = client.next_of_type("frame").await;
        if frame["sensorType"] == "depth" {
            break frame;
        }
    };
    assert_eq!(frame["data"]["width"], 512);
    assert_eq!(frame["data"]["height"], 424);
    assert!(frame["data"]["seq"].as_u64().unwrap() >= 1);
    assert!(frame["data"]["processTimeMs"].as_f64().is_some());

    // Body frames ride the same fan-out.
    let body_frame = loop {
        let frame = client.next_of_type("frame").await;
        if frame["sensorType"] == "body" {
            break frame;
        }
    };
    let bodies = body_frame["data"]["bodies"].as_array().unwrap();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0]["joints"]["handRight"]["position"]["x"].is_number());

    // Control records dispatch to the driver.
    client
        .send(&ClientMessage::SetLed {
            color: LedColor::Green,
        })
        .await;
    poll_until("LED to turn green", || {
        let camera = camera.clone();
        async move { camera.led() == LedColor::Green }
    })
    .await;

    client
        .send(&ClientMessage::SetIrEmitter { enabled: false })
        .await;
    poll_until("IR emitter to switch off", || {
        let camera = camera.clone();
        async move { !camera.ir_emitter() }
    })
    .await;

    // Stopping one sensor closes its device stream and reports status.
    client
        .send(&ClientMessage::StopSensor {
            sensor_type: StreamKind::Depth,
        })
        .await;
    let status = loop {
        let status = client.next_of_type("sensorStatus").await;
        if status["status"]["kind"] == "depth" && status["status"]["running"] == false {
            break status;
        }
    };
    assert_eq!(status["status"]["state"], "stopped");
    poll_until("depth stream to close", || {
        let camera = camera.clone();
        async move { !camera.open_streams().await.contains(&StreamKind::Depth) }
    })
    .await;

    // Last subscriber leaving stops the remaining sensors.
    drop(client);
    poll_until("all streams to close", || {
        let camera = camera.clone();
        async move { camera.open_streams().await.is_empty() }
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test]
async fn frame_sync_bundles_reach_subscribers() {
    let mut settings = test_settings(46271);
    settings.sensors.depth.enabled = false;
    settings.sensors.body.enabled = false;
    settings.frame_sync.enabled = true;
    settings.frame_sync.sources = vec![StreamKind::Depth, StreamKind::Body];

    let camera = MockCamera::new(&settings.device);
    let handle = service::launch(settings, Arc::new(camera))
        .await
        .expect("service launches");

    let mut client = TestClient::connect(handle.port()).await;
    client.identify("sync-viewer").await;

    let record = client.next_of_type("frameSync").await;
    let frames = record["frame"]["frames"].as_object().unwrap();
    assert!(frames.contains_key("depth"));
    assert!(frames.contains_key("body"));
    assert!(record["frame"]["maxDelayMs"].as_u64().unwrap() <= 33);

    handle.shutdown().await;
}

#[tokio::test]
async fn second_subscriber_sees_the_same_frames() {
    let mut settings = test_settings(46331);
    settings.sensors.body.enabled = false;

    let camera = MockCamera::new(&settings.device);
    let handle = service::launch(settings, Arc::new(camera))
        .await
        .expect("service launches");

    let mut first = TestClient::connect(handle.port()).await;
    first.identify("first").await;
    let mut second = TestClient::connect(handle.port()).await;
    second.identify("second").await;

    let a = first.next_of_type("frame").await;
    let b = second.next_of_type("frame").await;
    assert_eq!(a["sensorType"], "depth");
    assert_eq!(b["sensorType"], "depth");

    handle.shutdown().await;
}
