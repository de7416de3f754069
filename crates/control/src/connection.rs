//! Live node and observer sockets
//!
//! Map locks are held only for the map mutation; writes happen on a snapshot
//! of the connection list, serialized per connection by its own writer lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use hopwire_core::NodeId;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::{ControlError, Result};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write half of a socket that carries text frames
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn close(&mut self);
}

/// Told when a failed write removed a node's last connection
#[async_trait]
pub trait ConnectionLossListener: Send + Sync {
    async fn on_connections_lost(&self, node_id: NodeId);
}

/// In-process sink forwarding frames into a channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.tx
            .send(text)
            .map_err(|_| ControlError::SendFailed("channel closed".into()))
    }

    async fn close(&mut self) {}
}

/// One accepted socket
pub struct Connection {
    id: ConnectionId,
    tag: String,
    writer: Mutex<Box<dyn FrameSink>>,
    write_timeout: Duration,
}

impl Connection {
    pub fn new(
        sink: impl FrameSink + 'static,
        tag: impl Into<String>,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tag: tag.into(),
            writer: Mutex::new(Box::new(sink)),
            write_timeout,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Free-text version/role tag presented at handshake
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Write one frame within the write deadline
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send_text(text.to_string()).await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::SendFailed(format!(
                "write deadline ({:?}) exceeded on connection {}",
                self.write_timeout, self.id
            ))),
        }
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        writer.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .finish()
    }
}

/// Zero or more live connections per node
pub struct ConnectionRegistry {
    nodes: RwLock<HashMap<NodeId, Vec<Arc<Connection>>>>,
    primary_role: String,
    loss_listener: RwLock<Option<Weak<dyn ConnectionLossListener>>>,
}

impl ConnectionRegistry {
    pub fn new(primary_role: impl Into<String>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            primary_role: primary_role.into(),
            loss_listener: RwLock::new(None),
        }
    }

    pub fn set_loss_listener(&self, listener: Weak<dyn ConnectionLossListener>) {
        *self.loss_listener.write() = Some(listener);
    }

    pub fn register(&self, node_id: NodeId, conn: Arc<Connection>) {
        let count = {
            let mut nodes = self.nodes.write();
            let conns = nodes.entry(node_id).or_default();
            conns.push(conn.clone());
            conns.len()
        };
        debug!(node_id, conn_id = conn.id(), tag = conn.tag(), "Registered connection ({} live)", count);
    }

    /// Remove one connection; returns whether it was still registered
    pub fn unregister(&self, node_id: NodeId, conn_id: ConnectionId) -> bool {
        let mut nodes = self.nodes.write();
        let Some(conns) = nodes.get_mut(&node_id) else {
            return false;
        };
        let before = conns.len();
        conns.retain(|c| c.id() != conn_id);
        let removed = conns.len() != before;
        if conns.is_empty() {
            nodes.remove(&node_id);
        }
        removed
    }

    /// Snapshot of a node's connections in registration order
    pub fn connections(&self, node_id: NodeId) -> Vec<Arc<Connection>> {
        self.nodes.read().get(&node_id).cloned().unwrap_or_default()
    }

    pub fn count(&self, node_id: NodeId) -> usize {
        self.nodes.read().get(&node_id).map_or(0, Vec::len)
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.count(node_id) > 0
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }

    /// Write to every live connection of the node in registration order.
    ///
    /// Succeeds when at least one connection accepted the frame; connections
    /// whose write failed are unregistered and closed.
    pub async fn send(&self, node_id: NodeId, text: &str) -> Result<usize> {
        let conns = self.connections(node_id);
        if conns.is_empty() {
            return Err(ControlError::NotConnected(node_id));
        }

        let mut delivered = 0;
        let mut last_error = None;
        for conn in conns {
            match conn.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(node_id, conn_id = conn.id(), "Write failed, dropping connection: {}", e);
                    self.drop_connection(node_id, &conn).await;
                    last_error = Some(e);
                }
            }
        }

        if delivered == 0 {
            return Err(last_error.unwrap_or(ControlError::NotConnected(node_id)));
        }
        Ok(delivered)
    }

    /// Write to a single connection: the one tagged with the primary role,
    /// falling back to the others in registration order.
    pub async fn send_exclusive(&self, node_id: NodeId, text: &str) -> Result<ConnectionId> {
        let mut conns = self.connections(node_id);
        if conns.is_empty() {
            return Err(ControlError::NotConnected(node_id));
        }
        // Stable sort keeps registration order within each group
        conns.sort_by_key(|c| c.tag() != self.primary_role);

        let mut last_error = None;
        for conn in conns {
            match conn.send_text(text).await {
                Ok(()) => return Ok(conn.id()),
                Err(e) => {
                    warn!(node_id, conn_id = conn.id(), "Write failed, dropping connection: {}", e);
                    self.drop_connection(node_id, &conn).await;
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(ControlError::NotConnected(node_id)))
    }

    async fn drop_connection(&self, node_id: NodeId, conn: &Arc<Connection>) {
        let removed = self.unregister(node_id, conn.id());
        conn.close().await;
        if !removed || self.is_connected(node_id) {
            return;
        }
        let listener = self.loss_listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_connections_lost(node_id).await;
        }
    }
}

/// Dashboard observer sockets receiving status and telemetry broadcasts
pub struct ObserverRegistry {
    conns: RwLock<Vec<Arc<Connection>>>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, conn: Arc<Connection>) {
        self.conns.write().push(conn);
    }

    pub fn remove(&self, conn_id: ConnectionId) {
        self.conns.write().retain(|c| c.id() != conn_id);
    }

    pub fn count(&self) -> usize {
        self.conns.read().len()
    }

    /// Send one frame to every observer; returns how many accepted it
    pub async fn broadcast(&self, text: &str) -> usize {
        let conns = self.conns.read().clone();
        let mut delivered = 0;
        for conn in conns {
            match conn.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(conn_id = conn.id(), "Dropping observer: {}", e);
                    self.remove(conn.id());
                    conn.close().await;
                }
            }
        }
        delivered
    }

    pub async fn broadcast_json(&self, value: &serde_json::Value) -> usize {
        self.broadcast(&value.to_string()).await
    }
}
