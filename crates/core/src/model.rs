use serde::{Deserialize, Serialize};

use crate::{CoreError, ForwardId, NodeId, TunnelId, UserId};

/// Liveness as persisted on the node row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Offline,
    Online,
}

impl NodeStatus {
    /// Numeric form used in observer broadcasts (0 = offline, 1 = online)
    pub fn as_flag(&self) -> u8 {
        match self {
            NodeStatus::Offline => 0,
            NodeStatus::Online => 1,
        }
    }
}

/// An edge node running a forwarding agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Shared secret presented by the agent on connect; also used as the
    /// reporting credential in observer plugins
    pub secret: String,
    /// Public address other hops dial when no bind override is set
    pub server_ip: String,
    #[serde(default)]
    pub version: Option<String>,
    pub port_sta: u16,
    pub port_end: u16,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    /// Whether `port` lies inside the node's public range
    pub fn in_range(&self, port: u16) -> bool {
        port >= self.port_sta && port <= self.port_end
    }
}

/// Topology kind of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TunnelType {
    /// Plain chained port forward across every hop
    PortForward,
    /// Secure-transport relay between entry and exit
    Relay,
}

impl TryFrom<i32> for TunnelType {
    type Error = CoreError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TunnelType::PortForward),
            2 => Ok(TunnelType::Relay),
            other => Err(CoreError::InvalidTunnelType(other)),
        }
    }
}

impl From<TunnelType> for i32 {
    fn from(value: TunnelType) -> Self {
        match value {
            TunnelType::PortForward => 1,
            TunnelType::Relay => 2,
        }
    }
}

/// Topology descriptor shared by the forwards that use it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub id: TunnelId,
    pub name: String,
    pub in_node_id: NodeId,
    #[serde(default)]
    pub in_ip: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    #[serde(default)]
    pub out_node_id: Option<NodeId>,
    #[serde(default)]
    pub out_ip: Option<String>,
    /// Secure transport used by relay tunnels (`tls`, `wss`, `mtls`, ...)
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub interface_name: Option<String>,
}

fn default_protocol() -> String {
    "tls".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    #[default]
    Active,
    Paused,
}

/// Persisted user intent: one entry point, one or more remote targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forward {
    pub id: ForwardId,
    pub user_id: UserId,
    /// Per-user tunnel grant id; 0 for administrator-owned forwards
    #[serde(default)]
    pub user_tunnel_id: i64,
    pub tunnel_id: TunnelId,
    pub name: String,
    pub in_port: u16,
    #[serde(default)]
    pub out_port: Option<u16>,
    /// One or more comma-separated `host:port` targets
    pub remote_addr: String,
    #[serde(default)]
    pub interface_name: Option<String>,
    /// Load distribution across multiple targets (`fifo`, `round`, `rand`, `hash`)
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub speed_limit_id: Option<i64>,
    #[serde(default)]
    pub status: ForwardStatus,
    #[serde(default)]
    pub in_flow: u64,
    #[serde(default)]
    pub out_flow: u64,
    /// Creation time in unix milliseconds; input to relay credential derivation
    pub created_at: i64,
}

/// Fields supplied when creating a forward; ports are optional and allocated when absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewForward {
    pub user_id: UserId,
    #[serde(default)]
    pub user_tunnel_id: i64,
    pub tunnel_id: TunnelId,
    pub name: String,
    #[serde(default)]
    pub in_port: Option<u16>,
    pub remote_addr: String,
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub speed_limit_id: Option<i64>,
}

/// Persisted port of an intermediate hop, keyed by (forward, hop index)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardMidPort {
    pub forward_id: ForwardId,
    pub idx: usize,
    pub node_id: NodeId,
    pub port: u16,
}

/// One offline period of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRecord {
    pub id: i64,
    pub node_id: NodeId,
    pub down_at: i64,
    #[serde(default)]
    pub up_at: Option<i64>,
    /// Offline duration in seconds, set when the record is closed
    #[serde(default)]
    pub duration_secs: Option<i64>,
}

impl DisconnectRecord {
    pub fn is_open(&self) -> bool {
        self.up_at.is_none()
    }
}

/// Audit trail entry for a command pushed to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLog {
    pub node_id: NodeId,
    pub command: String,
    #[serde(default)]
    pub forward_id: Option<ForwardId>,
    pub success: bool,
    pub message: String,
    pub at: i64,
}
