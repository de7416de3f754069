//! Node connect/disconnect bookkeeping
//!
//! Connecting never re-pushes desired services; state is only applied on an
//! explicit save or redeploy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hopwire_core::{now_millis, Node, NodeId, NodeStatus};
use hopwire_protocol::{Command, UpgradeAgent};
use hopwire_store::Store;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    CommandDispatcher, Connection, ConnectionId, ConnectionLossListener, ConnectionRegistry,
    ControlError, ObserverRegistry, Result, SessionRegistry, SnapshotCache,
};

/// Availability change of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Online {
        node_id: NodeId,
        name: String,
        /// Length of the offline period that just ended, if one was recorded
        downtime: Option<Duration>,
    },
    Offline {
        node_id: NodeId,
        name: String,
    },
}

/// Receiver of node availability alerts (mail, chat hooks, ...)
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, event: NodeEvent);
}

/// Alert sink that only logs
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, event: NodeEvent) {
        match event {
            NodeEvent::Online { node_id, name, downtime } => match downtime {
                Some(d) => info!(node_id, "Node {} back online after {}s", name, d.as_secs()),
                None => info!(node_id, "Node {} online", name),
            },
            NodeEvent::Offline { node_id, name } => warn!(node_id, "Node {} offline", name),
        }
    }
}

/// Query parameters presented by a connecting agent
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub secret: String,
    pub version: Option<String>,
    pub role: Option<String>,
}

impl Handshake {
    /// Connection tag: the role when given, else the version
    pub fn tag(&self) -> String {
        self.role
            .clone()
            .or_else(|| self.version.clone())
            .unwrap_or_default()
    }
}

pub struct ReconnectHandler {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    observers: Arc<ObserverRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    sessions: Arc<SessionRegistry>,
    snapshots: Arc<SnapshotCache>,
    alerts: Arc<dyn AlertSink>,
    expected_version: Option<String>,
    download_url: Option<String>,
}

impl ReconnectHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        observers: Arc<ObserverRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        sessions: Arc<SessionRegistry>,
        snapshots: Arc<SnapshotCache>,
        alerts: Arc<dyn AlertSink>,
        expected_version: Option<String>,
        download_url: Option<String>,
    ) -> Self {
        Self {
            store,
            registry,
            observers,
            dispatcher,
            sessions,
            snapshots,
            alerts,
            expected_version,
            download_url,
        }
    }

    /// Resolve the node owning `secret`
    pub async fn authenticate(&self, handshake: &Handshake) -> Result<Node> {
        if handshake.secret.is_empty() {
            return Err(ControlError::Unauthorized("missing node secret".into()));
        }
        self.store
            .node_by_secret(&handshake.secret)
            .await?
            .ok_or_else(|| ControlError::Unauthorized("unknown node secret".into()))
    }

    /// Disconnected to Connected: register, flip online, close the open
    /// disconnect record, alert, broadcast, and upgrade a stale agent.
    pub async fn on_connect(
        &self,
        node: &Node,
        conn: Arc<Connection>,
        version: Option<String>,
    ) -> Result<()> {
        self.registry.register(node.id, conn);

        self.store
            .set_node_status(node.id, NodeStatus::Online, version.clone())
            .await?;

        let closed = self.store.close_disconnect(node.id, now_millis()).await?;
        let downtime = closed
            .as_ref()
            .and_then(|r| r.duration_secs)
            .map(|secs| Duration::from_secs(secs.max(0) as u64));

        if node.status != NodeStatus::Online || closed.is_some() {
            info!(node_id = node.id, version = ?version, "Node {} connected", node.name);
            self.alerts
                .notify(NodeEvent::Online {
                    node_id: node.id,
                    name: node.name.clone(),
                    downtime,
                })
                .await;
        }

        self.broadcast_status(node.id, NodeStatus::Online).await;

        if let Some(ref expected) = self.expected_version {
            if version.as_deref() != Some(expected.as_str()) {
                info!(
                    node_id = node.id,
                    "Agent version {:?} differs from {}, requesting upgrade", version, expected
                );
                let upgrade = Command::UpgradeAgent(UpgradeAgent {
                    version: expected.clone(),
                    url: self.download_url.clone().unwrap_or_default(),
                });
                if let Err(e) = self.dispatcher.send(node.id, &upgrade).await {
                    warn!(node_id = node.id, "Upgrade request failed: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Connected to Disconnected for one socket. Only the last live
    /// connection flips the node offline.
    pub async fn on_disconnect(&self, node_id: NodeId, conn_id: ConnectionId) -> Result<()> {
        self.registry.unregister(node_id, conn_id);
        if self.registry.is_connected(node_id) {
            return Ok(());
        }
        self.mark_offline(node_id).await.map(|_| ())
    }

    /// Flip nodes persisted as online that have no live connection.
    ///
    /// Returns how many nodes were flipped.
    pub async fn sweep_offline(&self) -> Result<usize> {
        let mut flipped = 0;
        for node in self.store.nodes().await? {
            if node.status == NodeStatus::Online && !self.registry.is_connected(node.id) {
                if self.mark_offline(node.id).await? {
                    flipped += 1;
                }
            }
        }
        Ok(flipped)
    }

    async fn mark_offline(&self, node_id: NodeId) -> Result<bool> {
        let Some(node) = self.store.node(node_id).await? else {
            return Ok(false);
        };
        if node.status == NodeStatus::Offline {
            return Ok(false);
        }

        self.store
            .set_node_status(node_id, NodeStatus::Offline, None)
            .await?;
        self.store.open_disconnect(node_id, now_millis()).await?;

        for session_id in self.sessions.close_node(node_id) {
            info!(node_id, session_id = %session_id, "Session ended with node connection");
        }
        self.snapshots.remove(node_id);

        self.alerts
            .notify(NodeEvent::Offline {
                node_id,
                name: node.name.clone(),
            })
            .await;
        self.broadcast_status(node_id, NodeStatus::Offline).await;
        Ok(true)
    }

    async fn broadcast_status(&self, node_id: NodeId, status: NodeStatus) {
        self.observers
            .broadcast_json(&json!({"type": "status", "id": node_id, "data": status.as_flag()}))
            .await;
    }
}

/// A failed write took the last socket; the read loop may not have noticed yet
#[async_trait]
impl ConnectionLossListener for ReconnectHandler {
    async fn on_connections_lost(&self, node_id: NodeId) {
        if let Err(e) = self.mark_offline(node_id).await {
            warn!(node_id, "Failed to mark node offline: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelSink, Correlation};
    use hopwire_store::MemoryStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingAlerts {
        events: Mutex<Vec<NodeEvent>>,
    }

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        async fn notify(&self, event: NodeEvent) {
            self.events.lock().push(event);
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        alerts: Arc<RecordingAlerts>,
        handler: ReconnectHandler,
    }

    async fn fixture(expected_version: Option<&str>) -> (Fixture, Node) {
        let store = Arc::new(MemoryStore::new());
        let node = store
            .save_node(Node {
                id: 0,
                name: "edge-1".into(),
                secret: "s3cret".into(),
                server_ip: "198.51.100.1".into(),
                version: None,
                port_sta: 20000,
                port_end: 30000,
                status: NodeStatus::Offline,
            })
            .await
            .unwrap();

        let registry = Arc::new(ConnectionRegistry::new("agent"));
        let dispatcher = Arc::new(CommandDispatcher::new(registry.clone(), Arc::new(Correlation::new())));
        let alerts = Arc::new(RecordingAlerts::default());
        let handler = ReconnectHandler::new(
            store.clone(),
            registry.clone(),
            Arc::new(ObserverRegistry::new()),
            dispatcher,
            Arc::new(SessionRegistry::new()),
            Arc::new(SnapshotCache::new()),
            alerts.clone(),
            expected_version.map(String::from),
            Some("https://downloads.example.com/agent".into()),
        );
        (Fixture { store, registry, alerts, handler }, node)
    }

    fn conn() -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (sink, rx) = ChannelSink::new();
        (Connection::new(sink, "agent", Duration::from_secs(1)), rx)
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (f, node) = fixture(None).await;
        let ok = f
            .handler
            .authenticate(&Handshake { secret: "s3cret".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(ok.id, node.id);

        assert!(matches!(
            f.handler.authenticate(&Handshake { secret: "nope".into(), ..Default::default() }).await,
            Err(ControlError::Unauthorized(_))
        ));
        assert!(matches!(
            f.handler.authenticate(&Handshake::default()).await,
            Err(ControlError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_last_connection_close_flips_offline() {
        let (f, node) = fixture(None).await;
        let (a, _rx_a) = conn();
        let (b, _rx_b) = conn();
        f.handler.on_connect(&node, a.clone(), Some("1.0.0".into())).await.unwrap();
        let node = f.store.node(node.id).await.unwrap().unwrap();
        f.handler.on_connect(&node, b.clone(), Some("1.0.0".into())).await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);

        f.handler.on_disconnect(node.id, a.id()).await.unwrap();
        let still = f.store.node(node.id).await.unwrap().unwrap();
        assert_eq!(still.status, NodeStatus::Online);
        assert!(f.store.disconnects(node.id).await.unwrap().is_empty());

        f.handler.on_disconnect(node.id, b.id()).await.unwrap();
        let offline = f.store.node(node.id).await.unwrap().unwrap();
        assert_eq!(offline.status, NodeStatus::Offline);
        let records = f.store.disconnects(node.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_open());

        let events = f.alerts.events.lock().clone();
        assert!(matches!(events.last(), Some(NodeEvent::Offline { .. })));
    }

    #[tokio::test]
    async fn test_failed_write_on_last_connection_flips_offline() {
        let (f, node) = fixture(None).await;
        let Fixture { store, registry, alerts, handler } = f;
        let handler = Arc::new(handler);
        registry.set_loss_listener(Arc::downgrade(&handler) as std::sync::Weak<dyn ConnectionLossListener>);

        let (a, rx) = conn();
        handler.on_connect(&node, a.clone(), None).await.unwrap();
        drop(rx);

        assert!(registry.send(node.id, "{}").await.is_err());
        assert!(!registry.is_connected(node.id));
        let offline = store.node(node.id).await.unwrap().unwrap();
        assert_eq!(offline.status, NodeStatus::Offline);
        assert_eq!(store.disconnects(node.id).await.unwrap().len(), 1);

        // The read loop ending afterwards changes nothing
        handler.on_disconnect(node.id, a.id()).await.unwrap();
        let offline_alerts = alerts
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, NodeEvent::Offline { .. }))
            .count();
        assert_eq!(offline_alerts, 1);
        assert_eq!(store.disconnects(node.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_closes_record_and_alerts_with_downtime() {
        let (f, node) = fixture(None).await;
        f.store.open_disconnect(node.id, now_millis() - 120_000).await.unwrap();

        let (a, _rx) = conn();
        f.handler.on_connect(&node, a, None).await.unwrap();

        let records = f.store.disconnects(node.id).await.unwrap();
        assert!(!records[0].is_open());
        assert!(records[0].duration_secs.unwrap() >= 120);

        let events = f.alerts.events.lock().clone();
        match &events[0] {
            NodeEvent::Online { downtime: Some(d), .. } => assert!(d.as_secs() >= 120),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_sends_upgrade() {
        let (f, node) = fixture(Some("2.0.0")).await;
        let (a, mut rx) = conn();
        f.handler.on_connect(&node, a, Some("1.9.0".into())).await.unwrap();

        let frame = rx.recv().await.unwrap();
        let (cmd, _) = Command::decode(&frame).unwrap();
        match cmd {
            Command::UpgradeAgent(up) => {
                assert_eq!(up.version, "2.0.0");
                assert_eq!(up.url, "https://downloads.example.com/agent");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_matching_version_sends_nothing() {
        let (f, node) = fixture(Some("2.0.0")).await;
        let (a, mut rx) = conn();
        f.handler.on_connect(&node, a, Some("2.0.0".into())).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_flips_orphaned_online_nodes() {
        let (f, node) = fixture(None).await;
        f.store
            .set_node_status(node.id, NodeStatus::Online, None)
            .await
            .unwrap();

        assert_eq!(f.handler.sweep_offline().await.unwrap(), 1);
        assert_eq!(f.handler.sweep_offline().await.unwrap(), 0);
        assert!(!f.registry.is_connected(node.id));
        assert_eq!(f.store.disconnects(node.id).await.unwrap().len(), 1);
    }

    #[test]
    fn test_handshake_tag() {
        let hs = Handshake { secret: "s".into(), version: Some("1.0".into()), role: None };
        assert_eq!(hs.tag(), "1.0");
        let hs = Handshake { role: Some("agent".into()), ..hs };
        assert_eq!(hs.tag(), "agent");
    }
}
