//! Declarative service definitions pushed to node agents
//!
//! A service is never stored by the panel. It is derived from a forward on
//! every push and queried back from the agent for drift checks, so every
//! type here serializes deterministically (ordered maps, fixed field order).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{net, ForwardId, UserId};

/// Metadata key marking services owned by this control plane
pub const MANAGED_BY_KEY: &str = "managedBy";

/// Value stored under [`MANAGED_BY_KEY`]
pub const MANAGED_BY: &str = "hopwire";

/// Deterministic service name for a forward.
///
/// Stable for the forward's lifetime; hop services append a suffix to it.
pub fn service_base_name(forward_id: ForwardId, user_id: UserId, user_tunnel_id: i64) -> String {
    format!("{}_{}_{}", forward_id, user_id, user_tunnel_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    pub listener: ListenerConfig,
    pub handler: HandlerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarder: Option<ForwarderConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer: Option<ObserverConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
}

impl ServiceConfig {
    /// Port the service listens on, parsed from `addr`
    pub fn port(&self) -> Option<u16> {
        net::port_of(&self.addr)
    }

    /// SHA-256 (hex) of the compact JSON encoding.
    ///
    /// Agents report the same hash for what they run, which lets a fresh
    /// self-report stand in for a live query.
    pub fn content_hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    /// Whether this service carries the managed-by marker
    pub fn is_managed(&self) -> bool {
        self.metadata.get(MANAGED_BY_KEY).and_then(Value::as_str) == Some(MANAGED_BY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ListenerConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    /// Name of the chain the handler dials through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
}

impl HandlerConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            auth: None,
            chain: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub nodes: Vec<ForwardTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorConfig {
    pub strategy: String,
    pub max_fails: u32,
    pub fail_timeout: String,
}

/// Ordered hop list a handler dials through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub hops: Vec<ChainHop>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHop {
    pub name: String,
    pub nodes: Vec<ChainNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    pub name: String,
    pub addr: String,
    pub connector: ConnectorConfig,
    pub dialer: DialerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialerConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Traffic observer plugin reporting back to the panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub name: String,
    pub plugin: PluginConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Named rate limiter (`$ 10MB` style limit expressions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    pub limits: Vec<String>,
}
