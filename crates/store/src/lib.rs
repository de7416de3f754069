//! hopwire Store
//!
//! Persistence seen from the control core: plain record CRUD/upsert plus a
//! sparse keyed configuration area (tunnel paths, bind and interface maps).
//!
//! [`MemoryStore`] keeps everything in memory and can persist to a JSON
//! state file; a relational backend implements the same [`Store`] trait.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use hopwire_core::{
    DisconnectRecord, Forward, ForwardId, ForwardMidPort, Node, NodeId, NodeStatus, OperationLog,
    Tunnel, TunnelId,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // Nodes
    async fn node(&self, id: NodeId) -> Result<Option<Node>>;
    async fn node_by_secret(&self, secret: &str) -> Result<Option<Node>>;
    async fn nodes(&self) -> Result<Vec<Node>>;
    /// Insert or replace; an id of 0 assigns the next free id
    async fn save_node(&self, node: Node) -> Result<Node>;
    async fn set_node_status(
        &self,
        id: NodeId,
        status: NodeStatus,
        version: Option<String>,
    ) -> Result<()>;

    // Tunnels
    async fn tunnel(&self, id: TunnelId) -> Result<Option<Tunnel>>;
    async fn tunnels(&self) -> Result<Vec<Tunnel>>;
    async fn save_tunnel(&self, tunnel: Tunnel) -> Result<Tunnel>;

    // Forwards
    async fn forward(&self, id: ForwardId) -> Result<Option<Forward>>;
    async fn forwards(&self) -> Result<Vec<Forward>>;
    async fn forwards_by_tunnel(&self, tunnel_id: TunnelId) -> Result<Vec<Forward>>;
    /// Insert or replace; an id of 0 assigns the next free id
    async fn save_forward(&self, forward: Forward) -> Result<Forward>;
    async fn delete_forward(&self, id: ForwardId) -> Result<()>;

    // Mid-hop ports
    async fn mid_ports(&self, forward_id: ForwardId) -> Result<Vec<ForwardMidPort>>;
    async fn upsert_mid_port(&self, mid: ForwardMidPort) -> Result<()>;
    async fn delete_mid_ports(&self, forward_id: ForwardId) -> Result<()>;

    // Keyed configuration entries
    async fn config(&self, key: &str) -> Result<Option<String>>;
    async fn set_config(&self, key: &str, value: String) -> Result<()>;
    async fn delete_config(&self, key: &str) -> Result<()>;

    // Node availability history
    /// Open a disconnect record; returns the already-open one if present
    async fn open_disconnect(&self, node_id: NodeId, at: i64) -> Result<DisconnectRecord>;
    /// Close the open record, computing its duration
    async fn close_disconnect(&self, node_id: NodeId, at: i64) -> Result<Option<DisconnectRecord>>;
    async fn disconnects(&self, node_id: NodeId) -> Result<Vec<DisconnectRecord>>;

    // Audit and telemetry
    async fn append_operation_log(&self, log: OperationLog) -> Result<()>;
    async fn operation_logs(&self, node_id: NodeId) -> Result<Vec<OperationLog>>;
    async fn record_system_info(&self, node_id: NodeId, info: serde_json::Value) -> Result<()>;
    async fn system_info(&self, node_id: NodeId) -> Result<Option<serde_json::Value>>;
}
