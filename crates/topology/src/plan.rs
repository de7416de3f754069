//! Hop planning
//!
//! A tunnel's path, bind-IP overrides and egress interfaces live in sparse
//! keyed config entries next to the tunnel row. Planning joins them with the
//! forward and the participating nodes into an ordered hop list.

use std::collections::BTreeMap;

use hopwire_core::{
    parse_remote_addrs, service_base_name, Forward, ForwardId, Node, NodeId, Tunnel, TunnelId,
    TunnelType,
};
use hopwire_store::Store;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Result, TopologyError};

pub fn path_key(tunnel_id: TunnelId) -> String {
    format!("tunnel_path_{}", tunnel_id)
}

pub fn bind_key(tunnel_id: TunnelId) -> String {
    format!("tunnel_bind_{}", tunnel_id)
}

pub fn iface_key(tunnel_id: TunnelId) -> String {
    format!("tunnel_iface_{}", tunnel_id)
}

pub fn deployed_key(forward_id: ForwardId) -> String {
    format!("forward_hops_{}", forward_id)
}

async fn load_entry<T: DeserializeOwned + Default>(store: &dyn Store, key: &str) -> Result<T> {
    match store.config(key).await? {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map_err(|e| TopologyError::InvalidTopology(format!("{}: {}", key, e))),
        _ => Ok(T::default()),
    }
}

async fn save_entry<T: Serialize>(store: &dyn Store, key: &str, value: &T, empty: bool) -> Result<()> {
    if empty {
        store.delete_config(key).await?;
        return Ok(());
    }
    let raw = serde_json::to_string(value)
        .map_err(|e| TopologyError::InvalidTopology(format!("{}: {}", key, e)))?;
    store.set_config(key, raw).await?;
    Ok(())
}

/// Per-tunnel overrides stored outside the tunnel row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelLayout {
    /// Ordered intermediate node ids
    pub path: Vec<NodeId>,
    /// Node id to the IP it listens on and is dialed at
    pub bind: BTreeMap<NodeId, String>,
    /// Node id to the network interface it dials out of
    pub iface: BTreeMap<NodeId, String>,
}

impl TunnelLayout {
    pub async fn load(store: &dyn Store, tunnel_id: TunnelId) -> Result<Self> {
        Ok(Self {
            path: load_entry(store, &path_key(tunnel_id)).await?,
            bind: load_entry(store, &bind_key(tunnel_id)).await?,
            iface: load_entry(store, &iface_key(tunnel_id)).await?,
        })
    }

    pub async fn save_path(store: &dyn Store, tunnel_id: TunnelId, path: &[NodeId]) -> Result<()> {
        save_entry(store, &path_key(tunnel_id), &path, path.is_empty()).await
    }

    pub async fn save_bind(
        store: &dyn Store,
        tunnel_id: TunnelId,
        bind: &BTreeMap<NodeId, String>,
    ) -> Result<()> {
        save_entry(store, &bind_key(tunnel_id), bind, bind.is_empty()).await
    }

    pub async fn save_iface(
        store: &dyn Store,
        tunnel_id: TunnelId,
        iface: &BTreeMap<NodeId, String>,
    ) -> Result<()> {
        save_entry(store, &iface_key(tunnel_id), iface, iface.is_empty()).await
    }
}

/// Service name to the node that last accepted it, per forward.
///
/// A hop whose node already holds its service is updated in place; any
/// other hop needs a fresh add.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeployedHops(BTreeMap<String, NodeId>);

impl DeployedHops {
    pub async fn load(store: &dyn Store, forward_id: ForwardId) -> Result<Self> {
        load_entry(store, &deployed_key(forward_id)).await
    }

    pub async fn save(&self, store: &dyn Store, forward_id: ForwardId) -> Result<()> {
        save_entry(store, &deployed_key(forward_id), self, self.0.is_empty()).await
    }

    pub async fn clear(store: &dyn Store, forward_id: ForwardId) -> Result<()> {
        store.delete_config(&deployed_key(forward_id)).await?;
        Ok(())
    }

    /// Whether `node_id` holds `service`
    pub fn holds(&self, service: &str, node_id: NodeId) -> bool {
        self.0.get(service) == Some(&node_id)
    }

    pub fn record(&mut self, service: String, node_id: NodeId) {
        self.0.insert(service, node_id);
    }

    pub fn forget(&mut self, service: &str) -> Option<NodeId> {
        self.0.remove(service)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.0.iter().map(|(name, node)| (name.as_str(), *node))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopRole {
    Entry,
    /// Intermediate hop at `path_index` in the tunnel path
    Mid { path_index: usize },
    /// Relay exit of a relay tunnel
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Position in the hop list (entry is 0)
    pub index: usize,
    pub role: HopRole,
    pub node: Node,
    /// Bind override: listen IP on this node and the address other hops dial
    pub bind_ip: Option<String>,
    /// Listen IP when different from the bind override (the tunnel's entry IP)
    pub listen_ip: Option<String>,
    /// Address other hops dial when no bind override is set
    pub advertise_ip: String,
    pub interface: Option<String>,
}

impl Hop {
    /// Host part of the listen address; empty means all interfaces
    pub fn listen_host(&self) -> &str {
        self.listen_ip.as_deref().unwrap_or("")
    }

    /// Host other hops use to reach this one; also its egress address
    pub fn dial_host(&self) -> &str {
        self.bind_ip.as_deref().unwrap_or(&self.advertise_ip)
    }
}

/// A forward resolved against its tunnel, layout and nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub forward: Forward,
    pub tunnel: Tunnel,
    pub hops: Vec<Hop>,
    /// Remote targets of the forward, in declared order
    pub targets: Vec<String>,
}

impl TopologyPlan {
    /// Resolve from the store
    pub async fn load(store: &dyn Store, forward: Forward) -> Result<Self> {
        let tunnel = store
            .tunnel(forward.tunnel_id)
            .await?
            .ok_or(TopologyError::TunnelNotFound(forward.tunnel_id))?;
        let layout = TunnelLayout::load(store, tunnel.id).await?;

        let mut ids = vec![tunnel.in_node_id];
        ids.extend(layout.path.iter().copied());
        if let Some(out) = tunnel.out_node_id {
            ids.push(out);
        }
        let mut nodes = BTreeMap::new();
        for id in ids {
            if nodes.contains_key(&id) {
                continue;
            }
            let node = store.node(id).await?.ok_or(TopologyError::NodeNotFound(id))?;
            nodes.insert(id, node);
        }

        Self::new(forward, tunnel, &layout, |id| nodes.get(&id).cloned())
    }

    /// Resolve against an explicit node lookup
    pub fn new(
        forward: Forward,
        tunnel: Tunnel,
        layout: &TunnelLayout,
        lookup: impl Fn(NodeId) -> Option<Node>,
    ) -> Result<Self> {
        let targets = parse_remote_addrs(&forward.remote_addr)
            .map_err(|e| TopologyError::InvalidTopology(e.to_string()))?;

        let node = |id: NodeId| lookup(id).ok_or(TopologyError::NodeNotFound(id));
        let hop = |index: usize, role: HopRole, node: Node| {
            let advertise_ip = match role {
                HopRole::Exit => tunnel
                    .out_ip
                    .clone()
                    .filter(|ip| !ip.is_empty())
                    .unwrap_or_else(|| node.server_ip.clone()),
                _ => node.server_ip.clone(),
            };
            let bind_ip = layout.bind.get(&node.id).cloned().filter(|ip| !ip.is_empty());
            let listen_ip = match role {
                HopRole::Entry => bind_ip
                    .clone()
                    .or_else(|| Some(tunnel.in_ip.clone()).filter(|ip| !ip.is_empty())),
                _ => bind_ip.clone(),
            };
            Hop {
                index,
                role,
                bind_ip,
                listen_ip,
                interface: layout.iface.get(&node.id).cloned().filter(|i| !i.is_empty()),
                advertise_ip,
                node,
            }
        };

        let mut hops = vec![hop(0, HopRole::Entry, node(tunnel.in_node_id)?)];
        for (path_index, id) in layout.path.iter().enumerate() {
            hops.push(hop(hops.len(), HopRole::Mid { path_index }, node(*id)?));
        }

        match tunnel.tunnel_type {
            TunnelType::PortForward => {}
            TunnelType::Relay => {
                let out = tunnel.out_node_id.ok_or_else(|| {
                    TopologyError::InvalidTopology(format!("relay tunnel {} has no exit node", tunnel.id))
                })?;
                hops.push(hop(hops.len(), HopRole::Exit, node(out)?));
            }
        }

        Ok(Self {
            forward,
            tunnel,
            hops,
            targets,
        })
    }

    pub fn base_name(&self) -> String {
        service_base_name(self.forward.id, self.forward.user_id, self.forward.user_tunnel_id)
    }

    /// Name of the service running on `hop`
    pub fn service_name(&self, hop: &Hop) -> String {
        let base = self.base_name();
        match hop.role {
            HopRole::Entry => base,
            HopRole::Mid { path_index } => format!("{}_mid_{}", base, path_index),
            HopRole::Exit => format!("{}_exit", base),
        }
    }

    pub fn chain_name(&self) -> String {
        format!("{}_chain", self.base_name())
    }

    pub fn entry(&self) -> &Hop {
        &self.hops[0]
    }

    pub fn exit(&self) -> Option<&Hop> {
        self.hops.iter().find(|h| h.role == HopRole::Exit)
    }

    pub fn mids(&self) -> impl Iterator<Item = &Hop> {
        self.hops
            .iter()
            .filter(|h| matches!(h.role, HopRole::Mid { .. }))
    }

    pub fn mid_count(&self) -> usize {
        self.mids().count()
    }

    pub fn is_relay(&self) -> bool {
        self.tunnel.tunnel_type == TunnelType::Relay
    }

    /// Every distinct service name across the hops
    pub fn service_names(&self) -> Vec<String> {
        self.hops.iter().map(|h| self.service_name(h)).collect()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use hopwire_core::{ForwardStatus, NodeStatus};

    pub fn node(id: NodeId, ip: &str) -> Node {
        Node {
            id,
            name: format!("node-{}", id),
            secret: format!("secret-{}", id),
            server_ip: ip.to_string(),
            version: None,
            port_sta: 20000,
            port_end: 40000,
            status: NodeStatus::Online,
        }
    }

    pub fn tunnel(kind: TunnelType, out: Option<NodeId>) -> Tunnel {
        Tunnel {
            id: 1,
            name: "t".into(),
            in_node_id: 1,
            in_ip: String::new(),
            tunnel_type: kind,
            out_node_id: out,
            out_ip: None,
            protocol: "tls".into(),
            interface_name: None,
        }
    }

    pub fn forward() -> Forward {
        Forward {
            id: 11,
            user_id: 2,
            user_tunnel_id: 0,
            tunnel_id: 1,
            name: "web".into(),
            in_port: 20000,
            out_port: None,
            remote_addr: "203.0.113.5:443".into(),
            interface_name: None,
            strategy: None,
            speed_limit_id: None,
            status: ForwardStatus::Active,
            in_flow: 0,
            out_flow: 0,
            created_at: 1_700_000_000_000,
        }
    }

    pub fn lookup(id: NodeId) -> Option<Node> {
        match id {
            1 => Some(node(1, "198.51.100.1")),
            2 => Some(node(2, "198.51.100.2")),
            3 => Some(node(3, "198.51.100.3")),
            _ => None,
        }
    }
}
