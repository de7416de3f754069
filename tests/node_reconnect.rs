//! Node connect/disconnect integration tests
//!
//! Drives the reconnect handler through channel-backed agent connections and
//! checks what ends up in the store, the observer feed and the alert sink.

use std::time::Duration;

use hopwire_control::{ChannelSink, Connection, ControlError, Handshake, NodeEvent};
use hopwire_core::NodeStatus;
use hopwire_store::Store;
use hopwire_tests::{Harness, AGENT_VERSION};

/// Node 7 drops its only socket, then comes back.
///
/// Verifies:
/// - the node flips offline and a disconnect record opens with a down time
/// - reconnecting closes that record with an up time and a duration
/// - an offline alert and then an online alert are emitted
/// - observers see status 0 then status 1
#[tokio::test]
async fn test_only_connection_closes_then_node_returns() {
    let h = Harness::new();
    h.add_node(7, "198.51.100.7", (20000, 30000)).await;

    // === Observer watching status broadcasts ===
    let (sink, mut feed) = ChannelSink::new();
    h.control
        .observers
        .add(Connection::new(sink, "observer", Duration::from_secs(1)));

    // === First connect ===
    let agent = h.connect(7).await;
    let node = h.node(7).await;
    assert_eq!(node.status, NodeStatus::Online);
    assert_eq!(node.version.as_deref(), Some(AGENT_VERSION));
    assert!(h.store.disconnects(7).await.unwrap().is_empty());

    // === Socket closes ===
    let before = hopwire_core::now_millis();
    agent.disconnect().await;

    assert_eq!(h.node(7).await.status, NodeStatus::Offline);
    let records = h.store.disconnects(7).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_open());
    assert!(records[0].down_at >= before);

    // === Reconnect ===
    let _agent = h.connect(7).await;
    assert_eq!(h.node(7).await.status, NodeStatus::Online);

    let records = h.store.disconnects(7).await.unwrap();
    assert_eq!(records.len(), 1);
    let closed = &records[0];
    assert!(closed.up_at.is_some());
    assert!(closed.up_at.unwrap() >= closed.down_at);
    assert!(closed.duration_secs.is_some());

    // === Alerts ===
    let events = h.alerts.events();
    assert!(matches!(events[0], NodeEvent::Online { node_id: 7, downtime: None, .. }));
    assert!(matches!(events[1], NodeEvent::Offline { node_id: 7, .. }));
    assert!(matches!(events[2], NodeEvent::Online { node_id: 7, downtime: Some(_), .. }));
    assert_eq!(events.len(), 3);

    // === Observer feed ===
    let mut statuses = Vec::new();
    while let Ok(frame) = feed.try_recv() {
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        if value["type"] == "status" {
            assert_eq!(value["id"], 7);
            statuses.push(value["data"].as_u64().unwrap());
        }
    }
    assert_eq!(statuses, vec![1, 0, 1]);
}

/// Closing one of two sockets keeps the node online.
#[tokio::test]
async fn test_second_connection_keeps_node_online() {
    let h = Harness::new();
    h.add_node(3, "198.51.100.3", (20000, 30000)).await;

    let first = h.connect(3).await;
    let second = h.connect(3).await;
    assert_eq!(h.control.registry.count(3), 2);

    first.disconnect().await;
    assert_eq!(h.node(3).await.status, NodeStatus::Online);
    assert!(h.store.disconnects(3).await.unwrap().is_empty());

    second.disconnect().await;
    assert_eq!(h.node(3).await.status, NodeStatus::Offline);
    assert_eq!(h.store.disconnects(3).await.unwrap().len(), 1);
}

/// Reconnecting does not push any service back to the node.
#[tokio::test]
async fn test_reconnect_does_not_repush_services() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 30000)).await;

    let agent = h.connect(1).await;
    agent.disconnect().await;
    let agent = h.connect(1).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(agent.received_kinds().is_empty());
}

/// A node persisted online without a socket is flipped by the sweep, once.
#[tokio::test]
async fn test_offline_sweep() {
    let h = Harness::new();
    h.add_node(2, "198.51.100.2", (20000, 30000)).await;
    h.add_node(4, "198.51.100.4", (20000, 30000)).await;
    h.store
        .set_node_status(2, NodeStatus::Online, None)
        .await
        .unwrap();
    let _live = h.connect(4).await;

    assert_eq!(h.control.reconnect.sweep_offline().await.unwrap(), 1);
    assert_eq!(h.node(2).await.status, NodeStatus::Offline);
    assert_eq!(h.node(4).await.status, NodeStatus::Online);
    assert_eq!(h.store.disconnects(2).await.unwrap().len(), 1);

    assert_eq!(h.control.reconnect.sweep_offline().await.unwrap(), 0);
    assert_eq!(h.store.disconnects(2).await.unwrap().len(), 1);
}

/// Unknown or empty secrets are rejected before anything is registered.
#[tokio::test]
async fn test_invalid_secret_rejected() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 30000)).await;

    let bad = Handshake {
        secret: "nope".into(),
        ..Default::default()
    };
    assert!(matches!(
        h.control.reconnect.authenticate(&bad).await,
        Err(ControlError::Unauthorized(_))
    ));
    assert!(matches!(
        h.control.reconnect.authenticate(&Handshake::default()).await,
        Err(ControlError::Unauthorized(_))
    ));

    let good = Handshake {
        secret: "secret-1".into(),
        ..Default::default()
    };
    assert_eq!(h.control.reconnect.authenticate(&good).await.unwrap().id, 1);
    assert!(!h.control.registry.is_connected(1));
}

/// A stale agent version triggers exactly one upgrade command.
#[tokio::test]
async fn test_version_mismatch_requests_upgrade() {
    let config = hopwire_control::ControlConfig {
        expected_agent_version: Some("2.0.0".into()),
        agent_download_url: Some("https://dl.example.com/agent".into()),
        ..hopwire_tests::test_config()
    };
    let h = Harness::with_config(config, Default::default());
    h.add_node(1, "198.51.100.1", (20000, 30000)).await;

    let agent = h.connect(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.received_kinds(), vec!["UpgradeAgent"]);
}
