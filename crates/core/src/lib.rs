//! hopwire Core
//!
//! Shared domain model for the hopwire control plane.
//!
//! ## Contents
//!
//! - **Records**: `Node`, `Tunnel`, `Forward`, `ForwardMidPort`, `DisconnectRecord`, `OperationLog`
//! - **Service model**: declarative service definitions pushed to node agents
//! - **Variants**: the TCP to UDP service mirroring applied before every push
//! - **Addressing**: overlay detection and `host:port` helpers

mod model;
mod net;
mod service;
mod variants;

pub use model::{
    DisconnectRecord, Forward, ForwardMidPort, ForwardStatus, NewForward, Node, NodeStatus,
    OperationLog, Tunnel, TunnelType,
};
pub use net::{
    host_of, is_overlay, join_host_port, parse_remote_addrs, port_of, OVERLAY_PORT_FLOOR,
    OVERLAY_PREFIX,
};
pub use service::{
    service_base_name, AuthConfig, ChainConfig, ChainHop, ChainNode, ConnectorConfig,
    DialerConfig, ForwardTarget, ForwarderConfig, HandlerConfig, LimiterConfig, ListenerConfig,
    ObserverConfig, PluginConfig, SelectorConfig, ServiceConfig, MANAGED_BY, MANAGED_BY_KEY,
};
pub use variants::{expand_names, expand_services, UDP_SUFFIX};

use thiserror::Error;

/// Node identifier
pub type NodeId = i64;

/// Forward identifier
pub type ForwardId = i64;

/// Tunnel identifier
pub type TunnelId = i64;

/// User identifier
pub type UserId = i64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid tunnel type: {0}")]
    InvalidTunnelType(i32),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
