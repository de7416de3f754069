//! hopwire Control
//!
//! The node control channel: every live agent socket, every command sent
//! over it, and every reply coming back.
//!
//! ## Components
//!
//! - [`ConnectionRegistry`] / [`ObserverRegistry`]: live node and dashboard sockets
//! - [`CommandDispatcher`]: encodes typed commands and routes them per command
//! - [`Correlation`]: request id to waiter tables (operation and diagnostic)
//! - [`ReconnectHandler`]: node status, disconnect records and upgrade on connect/close
//! - [`InboundRouter`]: fans inbound frames out to waiters, sessions, snapshots and observers
//! - [`AgentRpc`]: typed send-and-wait calls on top of the dispatcher

mod connection;
mod correlation;
mod dispatcher;
mod inbound;
mod reconnect;
mod rpc;
mod session;
mod snapshot;

pub use connection::{
    ChannelSink, Connection, ConnectionId, ConnectionLossListener, ConnectionRegistry, FrameSink,
    ObserverRegistry,
};
pub use correlation::{Correlation, CorrelationTable};
pub use dispatcher::CommandDispatcher;
pub use inbound::InboundRouter;
pub use reconnect::{AlertSink, Handshake, LogAlertSink, NodeEvent, ReconnectHandler};
pub use rpc::{retry_fixed, AgentRpc, PushKind, RpcTimeouts};
pub use session::SessionRegistry;
pub use snapshot::{NodeSnapshot, SnapshotCache};

use std::sync::{Arc, Weak};
use std::time::Duration;

use hopwire_core::NodeId;
use hopwire_protocol::ProtocolError;
use hopwire_store::{Store, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Node {0} not connected")]
    NotConnected(NodeId),

    #[error("Timed out waiting for {command} reply from node {node_id}")]
    Timeout { node_id: NodeId, command: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("{command} rejected by agent: {message}")]
    Rejected { command: String, message: String },

    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// Fresh opaque request id (16 hex chars)
pub fn new_request_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Control channel tunables
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Connection tag preferred for exclusive commands
    pub primary_role: String,
    pub write_timeout: Duration,
    pub timeouts: RpcTimeouts,
    /// Agent version this build expects; a mismatch on connect triggers an upgrade
    pub expected_agent_version: Option<String>,
    pub agent_download_url: Option<String>,
    /// Maximum age of a service self-report still trusted for drift checks
    pub snapshot_staleness: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            primary_role: "agent".to_string(),
            write_timeout: Duration::from_secs(5),
            timeouts: RpcTimeouts::default(),
            expected_agent_version: None,
            agent_download_url: None,
            snapshot_staleness: Duration::from_secs(15),
        }
    }
}

/// Every control-channel component, wired together
#[derive(Clone)]
pub struct ControlPlane {
    pub config: ControlConfig,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ConnectionRegistry>,
    pub observers: Arc<ObserverRegistry>,
    pub correlation: Arc<Correlation>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub sessions: Arc<SessionRegistry>,
    pub snapshots: Arc<SnapshotCache>,
    pub rpc: Arc<AgentRpc>,
    pub reconnect: Arc<ReconnectHandler>,
    pub inbound: Arc<InboundRouter>,
}

impl ControlPlane {
    pub fn new(store: Arc<dyn Store>, config: ControlConfig) -> Self {
        Self::with_alerts(store, config, Arc::new(LogAlertSink))
    }

    pub fn with_alerts(
        store: Arc<dyn Store>,
        config: ControlConfig,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.primary_role.clone()));
        let observers = Arc::new(ObserverRegistry::new());
        let correlation = Arc::new(Correlation::new());
        let dispatcher = Arc::new(CommandDispatcher::new(registry.clone(), correlation.clone()));
        let sessions = Arc::new(SessionRegistry::new());
        let snapshots = Arc::new(SnapshotCache::new());
        let rpc = Arc::new(AgentRpc::new(
            dispatcher.clone(),
            sessions.clone(),
            config.timeouts.clone(),
        ));
        let reconnect = Arc::new(ReconnectHandler::new(
            store.clone(),
            registry.clone(),
            observers.clone(),
            dispatcher.clone(),
            sessions.clone(),
            snapshots.clone(),
            alerts,
            config.expected_agent_version.clone(),
            config.agent_download_url.clone(),
        ));
        registry.set_loss_listener(Arc::downgrade(&reconnect) as Weak<dyn ConnectionLossListener>);
        let inbound = Arc::new(InboundRouter::new(
            correlation.clone(),
            sessions.clone(),
            snapshots.clone(),
            observers.clone(),
            store.clone(),
        ));

        Self {
            config,
            store,
            registry,
            observers,
            correlation,
            dispatcher,
            sessions,
            snapshots,
            rpc,
            reconnect,
            inbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique_hex() {
        let a = new_request_id();
        let b = new_request_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_error_display() {
        let err = ControlError::NotConnected(7);
        assert_eq!(err.to_string(), "Node 7 not connected");
        let err = ControlError::Timeout { node_id: 3, command: "ProbePort".into() };
        assert!(err.to_string().contains("ProbePort"));
    }
}
