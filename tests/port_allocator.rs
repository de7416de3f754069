//! Port allocation against live agents
//!
//! Ports come from agent suggestions when offered, otherwise from probing
//! the range; declared service ports and ports handed out earlier in the
//! same batch are never returned.

use hopwire_control::{ControlError, PushKind};
use hopwire_core::{HandlerConfig, ListenerConfig, ServiceConfig, OVERLAY_PORT_FLOOR};
use hopwire_tests::{AgentState, Harness};
use hopwire_topology::{PortAllocator, PortRange, TopologyError};

fn range(min: u16, max: u16) -> PortRange {
    PortRange { min, max, base: min }
}

/// Busy ports are skipped whether the agent suggests or not.
#[tokio::test]
async fn test_busy_ports_never_returned() {
    for suggest in [false, true] {
        let h = Harness::new();
        h.add_node(1, "198.51.100.1", (20000, 20010)).await;
        let _agent = h
            .connect_with(
                1,
                AgentState {
                    busy_ports: [20000, 20001, 20003].into_iter().collect(),
                    suggest,
                    ..Default::default()
                },
            )
            .await;

        let mut allocator = PortAllocator::new(&h.control.rpc);
        assert_eq!(allocator.allocate(1, range(20000, 20010)).await.unwrap(), 20002);
        assert_eq!(allocator.allocate(1, range(20000, 20010)).await.unwrap(), 20004);
    }
}

/// Ports of services the agent declares count as used even when nothing
/// is bound on them.
#[tokio::test]
async fn test_declared_service_ports_are_used() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 20010)).await;
    let agent = h
        .connect_with(
            1,
            AgentState {
                suggest: true,
                ..Default::default()
            },
        )
        .await;

    let service = ServiceConfig {
        name: "5_1_0".into(),
        addr: ":20000".into(),
        listener: ListenerConfig::new("tcp"),
        handler: HandlerConfig::new("tcp"),
        forwarder: None,
        metadata: Default::default(),
        chain: None,
        observer: None,
        limiter: None,
    };
    let rpc = &h.control.rpc;
    rpc.push_services(1, PushKind::Add, vec![service]).await.unwrap();
    rpc.pause_services(1, &["5_1_0".to_string()]).await.unwrap();
    assert!(agent.with_state(|s| s.paused.len() == 2));

    let mut allocator = PortAllocator::new(rpc);
    assert_eq!(allocator.allocate(1, range(20000, 20010)).await.unwrap(), 20001);

    // The owning forward may reuse its own port
    let mut owner = PortAllocator::new(rpc).with_owner("5_1_0");
    assert_eq!(owner.allocate(1, range(20000, 20000)).await.unwrap(), 20000);
}

/// Every port in one batch is distinct.
#[tokio::test]
async fn test_batch_ports_unique() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 20100)).await;
    let _agent = h.connect(1).await;

    let mut allocator = PortAllocator::new(&h.control.rpc);
    let mut ports = Vec::new();
    for _ in 0..10 {
        ports.push(allocator.allocate(1, range(20000, 20100)).await.unwrap());
    }
    let mut unique = ports.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ports.len());
    assert!(ports.iter().all(|p| allocator.is_reserved(1, *p)));
    assert!(!allocator.is_reserved(2, ports[0]));
}

/// Reservations are per node.
#[tokio::test]
async fn test_reservations_scoped_by_node() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 20010)).await;
    h.add_node(2, "198.51.100.2", (20000, 20010)).await;
    let _a = h.connect(1).await;
    let _b = h.connect(2).await;

    let mut allocator = PortAllocator::new(&h.control.rpc);
    allocator.reserve(1, 20000);
    assert_eq!(allocator.allocate(1, range(20000, 20010)).await.unwrap(), 20001);
    assert_eq!(allocator.allocate(2, range(20000, 20010)).await.unwrap(), 20000);
}

/// Search starts at the baseline and wraps downward.
#[tokio::test]
async fn test_search_wraps_below_baseline() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 20010)).await;
    let _agent = h
        .connect_with(
            1,
            AgentState {
                busy_ports: (20005..=20010).collect(),
                ..Default::default()
            },
        )
        .await;

    let mut allocator = PortAllocator::new(&h.control.rpc);
    let port = allocator
        .allocate(1, PortRange { min: 20000, max: 20010, base: 20005 })
        .await
        .unwrap();
    assert_eq!(port, 20004);
}

/// Both ends on the overlay: the public range is ignored.
#[tokio::test]
async fn test_overlay_range() {
    let h = Harness::new();
    let node = h.add_node(1, "10.126.126.2", (40000, 40010)).await;
    let _agent = h.connect(1).await;

    let r = PortRange::for_hop(&node, "10.126.126.1", "10.126.126.2", 20000);
    assert_eq!(r.min, OVERLAY_PORT_FLOOR);
    assert_eq!(r.max, u16::MAX);
    assert_eq!(r.base, 20000);

    let mut allocator = PortAllocator::new(&h.control.rpc);
    assert_eq!(allocator.allocate(1, r).await.unwrap(), 20000);

    // One public end keeps the node's range
    let r = PortRange::for_hop(&node, "198.51.100.1", "10.126.126.2", 20000);
    assert_eq!((r.min, r.max, r.base), (40000, 40010, 40000));
}

/// A full range is reported with its bounds.
#[tokio::test]
async fn test_exhaustion() {
    let h = Harness::new();
    h.add_node(6, "198.51.100.6", (20000, 20003)).await;
    let _agent = h
        .connect_with(
            6,
            AgentState {
                busy_ports: (20000..=20003).collect(),
                ..Default::default()
            },
        )
        .await;

    let mut allocator = PortAllocator::new(&h.control.rpc);
    let err = allocator.allocate(6, range(20000, 20003)).await.unwrap_err();
    assert!(matches!(
        err,
        TopologyError::PortExhausted { node_id: 6, min: 20000, max: 20003 }
    ));
    assert_eq!(
        err.to_string(),
        "No free port on node 6 in 20000..=20003"
    );
}

/// Probing stops at the budget even when later ports are free.
#[tokio::test]
async fn test_port_search_budget_bounds_allocation() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 20010)).await;
    let agent = h
        .connect_with(
            1,
            AgentState {
                busy_ports: (20000..=20002).collect(),
                ..Default::default()
            },
        )
        .await;

    let mut tight = PortAllocator::new(&h.control.rpc).with_probe_budget(2);
    let err = tight.allocate(1, range(20000, 20010)).await.unwrap_err();
    assert!(matches!(err, TopologyError::PortExhausted { node_id: 1, .. }));
    let probes = agent
        .received_kinds()
        .into_iter()
        .filter(|k| *k == "ProbePort")
        .count();
    assert_eq!(probes, 2);

    let mut wider = PortAllocator::new(&h.control.rpc).with_probe_budget(4);
    assert_eq!(wider.allocate(1, range(20000, 20010)).await.unwrap(), 20003);
}

/// Suggestions short-circuit probing.
#[tokio::test]
async fn test_suggestions_used_when_offered() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 20010)).await;
    let agent = h
        .connect_with(
            1,
            AgentState {
                busy_ports: [20000].into_iter().collect(),
                suggest: true,
                ..Default::default()
            },
        )
        .await;

    let mut allocator = PortAllocator::new(&h.control.rpc);
    assert_eq!(allocator.allocate(1, range(20000, 20010)).await.unwrap(), 20001);
    assert_eq!(agent.received_kinds(), vec!["QueryServices", "SuggestPorts"]);
}

/// An unreachable node fails the allocation instead of exhausting it.
#[tokio::test]
async fn test_offline_node() {
    let h = Harness::new();
    h.add_node(1, "198.51.100.1", (20000, 20010)).await;

    let mut allocator = PortAllocator::new(&h.control.rpc);
    let err = allocator.allocate(1, range(20000, 20010)).await.unwrap_err();
    assert!(matches!(
        err,
        TopologyError::Control(ControlError::NotConnected(1))
    ));
}
