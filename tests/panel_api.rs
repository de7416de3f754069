//! Panel API integration tests
//!
//! Calls the JSON method surface of a wired panel the way the dashboard does,
//! with in-process agents standing in for the edge nodes.

use std::sync::Arc;

use hopwire_server::{Panel, PanelConfig};
use hopwire_store::MemoryStore;
use hopwire_tests::{FakeAgent, RecordingAlerts};
use serde_json::{json, Value};

fn panel() -> Panel {
    Panel::with_store(
        PanelConfig::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingAlerts::default()),
    )
}

async fn call(panel: &Panel, method: &str, params: Value) -> Value {
    panel.api().handle(method, Some(params)).await.unwrap()
}

async fn node(panel: &Panel, name: &str, ip: &str) -> i64 {
    let saved = call(
        panel,
        "node_save",
        json!({"id": 0, "name": name, "secret": format!("{}-secret", name),
               "serverIp": ip, "portSta": 20000, "portEnd": 20100}),
    )
    .await;
    saved["data"]["id"].as_i64().unwrap()
}

async fn agent(panel: &Panel, id: i64) -> FakeAgent {
    use hopwire_store::Store;
    let node = panel.control().store.node(id).await.unwrap().unwrap();
    FakeAgent::connect(panel.control(), &node).await
}

// === Forward round trip ===

/// Dashboard flow for a one-hop forward.
///
/// Verifies:
/// - tunnel, path and forward are created through the method surface
/// - the create reply carries the per-hop results
/// - status, list and delete reflect the deployed forward
#[tokio::test]
async fn test_forward_round_trip() {
    let panel = panel();
    let entry_id = node(&panel, "edge-a", "198.51.100.1").await;
    let mid_id = node(&panel, "edge-b", "198.51.100.2").await;
    let entry = agent(&panel, entry_id).await;
    let mid = agent(&panel, mid_id).await;

    let tunnel = call(
        &panel,
        "tunnel_save",
        json!({"id": 0, "name": "t", "inNodeId": entry_id, "type": 1}),
    )
    .await;
    let tunnel_id = tunnel["data"]["id"].as_i64().unwrap();

    let reply = call(&panel, "tunnel_path_set", json!({"id": tunnel_id, "path": [mid_id]})).await;
    assert_eq!(reply["success"], true);

    let created = call(
        &panel,
        "forward_create",
        json!({"userId": 3, "tunnelId": tunnel_id, "name": "web",
               "remoteAddr": "203.0.113.5:443"}),
    )
    .await;
    assert_eq!(created["success"], true, "{}", created);
    assert_eq!(created["data"]["hops"].as_array().unwrap().len(), 2);
    let forward_id = created["data"]["forward"]["id"].as_i64().unwrap();
    let in_port = created["data"]["forward"]["inPort"].as_u64().unwrap();
    assert!((20000..=20100).contains(&in_port));

    let base = format!("{}_3_0", forward_id);
    assert!(entry.service(&base).is_some());
    assert!(mid.service(&format!("{}_mid_0", base)).is_some());

    let status = call(&panel, "forward_status", json!({"id": forward_id})).await;
    assert_eq!(status["data"]["healthy"], true);
    assert_eq!(status["data"]["hops"][0]["source"], "live");

    let listed = call(&panel, "forward_list", json!({"tunnelId": tunnel_id})).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let deleted = call(&panel, "forward_delete", json!({"id": forward_id})).await;
    assert_eq!(deleted["success"], true);
    assert!(entry.service_names().is_empty());

    let err = panel
        .api()
        .handle("forward_get", Some(json!({"id": forward_id})))
        .await
        .unwrap_err();
    assert_eq!(err, format!("Forward error: Forward {} not found", forward_id));
}

/// A hop that refuses its service makes the reply unsuccessful and names it.
#[tokio::test]
async fn test_failed_hop_named_in_message() {
    let panel = panel();
    let entry_id = node(&panel, "edge-a", "198.51.100.1").await;
    let entry = agent(&panel, entry_id).await;
    entry.with_state(|s| s.reject.insert("1_3_0".to_string()));

    call(
        &panel,
        "tunnel_save",
        json!({"id": 0, "name": "t", "inNodeId": entry_id, "type": 1}),
    )
    .await;
    let created = call(
        &panel,
        "forward_create",
        json!({"userId": 3, "tunnelId": 1, "name": "web", "remoteAddr": "203.0.113.5:443"}),
    )
    .await;
    assert_eq!(created["success"], false);
    let message = created["message"].as_str().unwrap();
    assert!(message.starts_with(&format!("hop 0 (node {}):", entry_id)), "{}", message);
    // The record stays so the push can be retried
    assert_eq!(created["data"]["forward"]["id"], 1);
}

// === Validation ===

#[tokio::test]
async fn test_relay_tunnel_needs_exit() {
    let panel = panel();
    let err = panel
        .api()
        .handle(
            "tunnel_save",
            Some(json!({"id": 0, "name": "r", "inNodeId": 1, "type": 2})),
        )
        .await
        .unwrap_err();
    assert_eq!(err, "Relay tunnel needs an exit node");
}

#[tokio::test]
async fn test_connections_reported_per_node() {
    let panel = panel();
    let id = node(&panel, "edge-a", "198.51.100.1").await;
    let _a = agent(&panel, id).await;
    let _b = agent(&panel, id).await;

    let listed = call(&panel, "node_list", json!({})).await;
    assert_eq!(listed["data"][0]["connections"], 2);
    assert_eq!(listed["data"][0]["status"], "online");
}
