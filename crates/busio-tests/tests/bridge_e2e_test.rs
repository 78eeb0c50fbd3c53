//! End-to-end tests for the daemon's HTTP bridge
//!
//! Each test starts a daemon on an ephemeral port and talks to it with a
//! real HTTP client.
//!
//! Run with: cargo test -p busio-tests --test bridge_e2e_test

use std::time::Duration;

use busio_core::{IfaceState, IoStatus, Node};
use busiod::{Daemon, DaemonConfig};
use busio_tests::{loopback, test_worker_config};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(3);

fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.worker = test_worker_config();
    config
}

async fn wait_status(client: &Client, base: &str, pred: impl Fn(&IoStatus) -> bool) -> IoStatus {
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let resp = client.get(format!("{}/io/status", base)).send().await.unwrap();
        if resp.status() == StatusCode::OK {
            let status: IoStatus = resp.json().await.unwrap();
            if pred(&status) {
                return status;
            }
        }
        assert!(std::time::Instant::now() < deadline, "expected status never reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_operational(client: &Client, base: &str, iface_id: u16) -> IoStatus {
    wait_status(client, base, |s| {
        s.get(iface_id).map(IfaceState::is_operational).unwrap_or(false)
    })
    .await
}

#[tokio::test]
async fn test_health_and_status_lifecycle() {
    let daemon = Daemon::start(test_config()).await.unwrap();
    let base = format!("http://{}", daemon.local_addr());
    let client = Client::new();

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "OK");

    let resp = client
        .put(format!("{}/io/config", base))
        .json(&json!({
            "iface_config": [
                {"iface_id": 4, "transport": {"type": "loopback"}},
                {"iface_id": 9, "transport": {"type": "loopback", "construction_error": "unplugged"}}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let status = wait_status(&client, &base, |s| {
        s.get(4).map(IfaceState::is_operational).unwrap_or(false)
            && matches!(s.get(9), Some(IfaceState::Failure(_)))
    })
    .await;
    let ids: Vec<u16> = status.iface_status.iter().map(|s| s.iface_id).collect();
    assert_eq!(ids, vec![4, 9]);

    // Failures show up in the raw JSON under "failure"
    let body: serde_json::Value = client
        .get(format!("{}/io/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let reason = body["iface_status"][1]["state"]["failure"].as_str().unwrap();
    assert!(reason.contains("unplugged"));

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_spoof_streamed_as_capture() {
    let daemon = Daemon::start(test_config()).await.unwrap();
    let base = format!("http://{}", daemon.local_addr());
    let client = Client::new();

    client
        .put(format!("{}/io/config", base))
        .json(&json!({"iface_config": [{"iface_id": 1, "transport": {"type": "loopback"}}]}))
        .send()
        .await
        .unwrap();
    wait_operational(&client, &base, 1).await;

    let resp = client.get(format!("{}/io/capture", base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let mut stream = resp.bytes_stream();

    let resp = client
        .post(format!("{}/io/spoof", base))
        .json(&json!({
            "timeout": 1.0,
            "priority": 2,
            "session": {"service": {"service_id": 430, "source": 10, "destination": 20, "is_request": true}},
            "transfer_id": 77,
            "payload": "c0ffee"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let mut received = String::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while !received.contains("\n\n") {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("no capture event")
            .expect("stream ended")
            .unwrap();
        received.push_str(&String::from_utf8_lossy(&chunk));
    }

    assert!(received.contains("event: capture"));
    let data = received
        .lines()
        .find_map(|l| l.strip_prefix("data: "))
        .expect("no data line");
    let capture: serde_json::Value = serde_json::from_str(data).unwrap();
    assert_eq!(capture["iface_id"], 1);
    assert_eq!(capture["sequence_number"], 0);
    assert_eq!(capture["frame"]["loopback"]["transfer_id"], 77);
    assert_eq!(capture["frame"]["loopback"]["payload"], "c0ffee");

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_spoof_rejected() {
    let daemon = Daemon::start(test_config()).await.unwrap();
    let base = format!("http://{}", daemon.local_addr());
    let client = Client::new();

    let resp = client
        .post(format!("{}/io/spoof", base))
        .json(&json!({
            "timeout": 1.0,
            "priority": 8,
            "session": {"subject": {"subject_id": 1}},
            "payload": ""
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("{}/io/spoof", base))
        .json(&json!({"timeout": 1.0, "session": {"subject": {"subject_id": 1}}, "payload": "zz"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_startup_config_applied() {
    let mut config = test_config();
    config.iface = vec![loopback(12)];
    let daemon = Daemon::start(config).await.unwrap();
    let base = format!("http://{}", daemon.local_addr());

    wait_operational(&Client::new(), &base, 12).await;
    daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deadman_stops_daemon() {
    let mut config = test_config();
    config.node.heartbeat_timeout_ms = 200;
    let daemon = Daemon::start(config).await.unwrap();
    let base = format!("http://{}", daemon.local_addr());
    let client = Client::new();

    // Heartbeats keep it alive
    for _ in 0..5 {
        let resp = client.post(format!("{}/heartbeat", base)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        tokio::time::sleep(Duration::from_millis(80)).await;
    }
    assert!(!daemon.node().is_shutdown());

    // Silence closes the node and the daemon winds down by itself
    tokio::time::timeout(Duration::from_secs(3), daemon.wait())
        .await
        .expect("daemon did not stop")
        .unwrap();
}
