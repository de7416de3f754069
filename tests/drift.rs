//! Drift check integration tests
//!
//! Deploys a two-hop forward, tampers with what the fake agents run and
//! checks that the status report pins the difference to the right hop.

use hopwire_core::{NewForward, Tunnel, TunnelType, MANAGED_BY_KEY};
use hopwire_store::Store;
use hopwire_tests::{FakeAgent, Harness};
use hopwire_topology::CheckSource;

/// Entry on node 1, one mid hop on node 2, remote target behind it
async fn two_hop_forward() -> (Harness, FakeAgent, FakeAgent) {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 30000)).await;
    h.add_node(2, "198.51.100.2", (40000, 40100)).await;
    h.add_tunnel(Tunnel {
        id: 1,
        name: "t1".into(),
        in_node_id: 1,
        in_ip: String::new(),
        tunnel_type: TunnelType::PortForward,
        out_node_id: None,
        out_ip: None,
        protocol: "tls".into(),
        interface_name: None,
    })
    .await;
    h.forwards.set_path(1, vec![2]).await.unwrap();
    let entry = h.connect(1).await;
    let mid = h.connect(2).await;

    let outcome = h
        .forwards
        .create(NewForward {
            user_id: 2,
            tunnel_id: 1,
            name: "web".into(),
            in_port: Some(20000),
            remote_addr: "203.0.113.5:443".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(outcome.success());
    (h, entry, mid)
}

/// A freshly deployed forward checks out over live queries.
#[tokio::test]
async fn test_healthy_after_create() {
    let (h, _entry, _mid) = two_hop_forward().await;

    let health = h.forwards.status(1).await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.forward_id, 1);
    assert_eq!(health.hops.len(), 2);
    for hop in &health.hops {
        assert_eq!(hop.source, CheckSource::Live);
        assert_eq!(hop.actual_port, hop.expected_port);
        assert_eq!(hop.listening, Some(true));
    }
    assert_eq!(health.hops[0].expected_port, Some(20000));
}

/// The entry node runs the service on another port.
///
/// Verifies:
/// - only the entry hop is reported unhealthy
/// - both the expected and the actual port are reported
#[tokio::test]
async fn test_entry_port_mismatch() {
    let (h, entry, _mid) = two_hop_forward().await;
    entry.with_state(|s| {
        if let Some(svc) = s.services.get_mut("1_2_0") {
            svc.addr = ":20005".into();
        }
    });

    let health = h.forwards.status(1).await.unwrap();
    assert!(!health.healthy);
    let bad: Vec<_> = health.unhealthy_hops().collect();
    assert_eq!(bad.len(), 1);
    assert_eq!(bad[0].index, 0);
    assert_eq!(bad[0].expected_port, Some(20000));
    assert_eq!(bad[0].actual_port, Some(20005));
    assert!(health.hops[1].healthy);
}

/// A fresh self-report with matching hashes answers without a live query.
#[tokio::test]
async fn test_snapshot_answers_without_query() {
    let (h, entry, mid) = two_hop_forward().await;
    entry.report().await;
    mid.report().await;
    let queried = entry.received_kinds().len();

    let health = h.forwards.status(1).await.unwrap();
    assert!(health.healthy);
    assert!(health.hops.iter().all(|hop| hop.source == CheckSource::Snapshot));
    assert_eq!(entry.received_kinds().len(), queried);
}

/// A service missing from a fresh self-report is unhealthy straight away.
#[tokio::test]
async fn test_snapshot_missing_service() {
    let (h, _entry, mid) = two_hop_forward().await;
    mid.with_state(|s| s.services.clear());
    mid.report().await;

    let health = h.forwards.status(1).await.unwrap();
    let hop = &health.hops[1];
    assert!(!hop.healthy);
    assert_eq!(hop.source, CheckSource::Snapshot);
    assert_eq!(hop.message, "service not reported by node");
}

/// Entry metadata must carry every declared key.
#[tokio::test]
async fn test_entry_metadata_mismatch() {
    let (h, entry, _mid) = two_hop_forward().await;
    entry.with_state(|s| {
        if let Some(svc) = s.services.get_mut("1_2_0") {
            svc.metadata.remove(MANAGED_BY_KEY);
        }
    });

    let health = h.forwards.status(1).await.unwrap();
    let hop = &health.hops[0];
    assert!(!hop.healthy);
    assert!(!hop.metadata_ok);
    assert_eq!(hop.actual_port, Some(20000));
    assert!(hop.message.contains("metadata mismatch"));
}

/// A paused service is present but not listening.
#[tokio::test]
async fn test_paused_is_not_listening() {
    let (h, _entry, _mid) = two_hop_forward().await;
    h.forwards.pause(1).await.unwrap();

    let health = h.forwards.status(1).await.unwrap();
    assert!(health.hops.iter().all(|hop| hop.listening == Some(false)));
    assert!(!health.healthy);
}

/// A mid hop with no persisted port is reported without asking the node.
#[tokio::test]
async fn test_missing_mid_port() {
    let (h, _entry, mid) = two_hop_forward().await;
    h.store.delete_mid_ports(1).await.unwrap();
    let before = mid.received_kinds().len();

    let health = h.forwards.status(1).await.unwrap();
    let hop = &health.hops[1];
    assert!(!hop.healthy);
    assert_eq!(hop.source, CheckSource::None);
    assert_eq!(hop.expected_port, None);
    assert_eq!(hop.message, "no port recorded for hop");
    assert!(health.hops[0].healthy);
    assert_eq!(mid.received_kinds().len(), before);
}

/// An unreachable node yields an unhealthy hop, not an error.
#[tokio::test]
async fn test_disconnected_node() {
    let (h, _entry, mid) = two_hop_forward().await;
    mid.disconnect().await;

    let health = h.forwards.status(1).await.unwrap();
    let hop = &health.hops[1];
    assert!(!hop.healthy);
    assert_eq!(hop.source, CheckSource::None);
    assert_eq!(hop.message, "Node 2 not connected");
}
