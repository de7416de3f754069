//! Port allocation
//!
//! Discovery order per node: declared live services build a used set, then
//! the agent is asked for OS-free ports in batches, then candidates are
//! scanned upward and downward from the baseline, each confirmed by a live
//! probe. Concurrent allocations against one node are not serialized; the
//! drift check catches the rare collision.

use std::collections::{HashMap, HashSet};

use hopwire_control::{AgentRpc, ControlError};
use hopwire_core::{is_overlay, Node, NodeId, OVERLAY_PORT_FLOOR};
use tracing::debug;

use crate::{Result, TopologyError};

/// Ports requested per suggestion batch
const SUGGEST_BATCH: u16 = 8;
/// Suggestion batches before falling back to probing
const SUGGEST_ROUNDS: usize = 3;
/// Probe RPCs per allocation before giving up, unless configured otherwise
pub const DEFAULT_PROBE_BUDGET: usize = 64;

/// Search window for one allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
    /// Where the search starts
    pub base: u16,
}

impl PortRange {
    /// Window for a hop on `node`.
    ///
    /// When both the previous hop's egress and this hop's ingress sit on the
    /// overlay, the node's public range is ignored and the search runs from
    /// the overlay floor upward.
    pub fn for_hop(node: &Node, prev_egress: &str, ingress: &str, preferred: u16) -> Self {
        if is_overlay(prev_egress) && is_overlay(ingress) {
            return Self {
                min: OVERLAY_PORT_FLOOR,
                max: u16::MAX,
                base: preferred.max(OVERLAY_PORT_FLOOR),
            };
        }
        Self::public(node, preferred)
    }

    /// The node's public range, starting at `preferred` when it lies inside
    pub fn public(node: &Node, preferred: u16) -> Self {
        let (min, max) = if node.port_sta <= node.port_end {
            (node.port_sta, node.port_end)
        } else {
            (node.port_end, node.port_sta)
        };
        let base = if (min..=max).contains(&preferred) { preferred } else { min };
        Self { min, max, base }
    }

    pub fn contains(&self, port: u16) -> bool {
        port != 0 && (self.min..=self.max).contains(&port)
    }

    /// Scan order: baseline upward, then downward
    fn candidates(&self) -> impl Iterator<Item = u16> {
        let up = self.base..=self.max;
        let down = (self.min..self.base).rev();
        up.chain(down).filter(|p| *p != 0)
    }
}

/// Allocates ports for one build batch.
///
/// Ports handed out stay reserved for the life of the allocator so two hops
/// of the same forward never receive the same port on the same node.
pub struct PortAllocator<'a> {
    rpc: &'a AgentRpc,
    reserved: HashMap<NodeId, HashSet<u16>>,
    /// Service name prefix whose declared ports do not count as used
    owner: Option<String>,
    probe_budget: usize,
}

impl<'a> PortAllocator<'a> {
    pub fn new(rpc: &'a AgentRpc) -> Self {
        Self {
            rpc,
            reserved: HashMap::new(),
            owner: None,
            probe_budget: DEFAULT_PROBE_BUDGET,
        }
    }

    /// Cap on `ProbePort` round trips per allocation (at least one)
    pub fn with_probe_budget(mut self, budget: usize) -> Self {
        self.probe_budget = budget.max(1);
        self
    }

    /// Ignore services whose name starts with `prefix` (the forward being rebuilt)
    pub fn with_owner(mut self, prefix: impl Into<String>) -> Self {
        self.owner = Some(prefix.into());
        self
    }

    /// Mark a port as taken for this batch without allocating it
    pub fn reserve(&mut self, node_id: NodeId, port: u16) {
        self.reserved.entry(node_id).or_default().insert(port);
    }

    pub fn is_reserved(&self, node_id: NodeId, port: u16) -> bool {
        self.reserved.get(&node_id).map_or(false, |r| r.contains(&port))
    }

    /// Find a free port on `node_id` within `range`
    pub async fn allocate(&mut self, node_id: NodeId, range: PortRange) -> Result<u16> {
        let mut used = self.declared_ports(node_id).await?;
        if let Some(reserved) = self.reserved.get(&node_id) {
            used.extend(reserved.iter().copied());
        }

        let port = match self.from_suggestions(node_id, &range, &used).await? {
            Some(port) => port,
            None => self
                .from_probes(node_id, &range, &used)
                .await?
                .ok_or(TopologyError::PortExhausted {
                    node_id,
                    min: range.min,
                    max: range.max,
                })?,
        };

        debug!(node_id, port, "Allocated port in {}..={}", range.min, range.max);
        self.reserve(node_id, port);
        Ok(port)
    }

    async fn declared_ports(&self, node_id: NodeId) -> Result<HashSet<u16>> {
        let services = self.rpc.query_services(node_id, None).await?;
        Ok(services
            .iter()
            .filter(|s| match self.owner {
                Some(ref prefix) => !s.name.starts_with(prefix.as_str()),
                None => true,
            })
            .filter_map(|s| s.port())
            .collect())
    }

    async fn from_suggestions(
        &self,
        node_id: NodeId,
        range: &PortRange,
        used: &HashSet<u16>,
    ) -> Result<Option<u16>> {
        let mut base = range.base;
        for _ in 0..SUGGEST_ROUNDS {
            let ports = match self
                .rpc
                .suggest_ports(node_id, base, SUGGEST_BATCH, range.min, range.max)
                .await
            {
                Ok(ports) => ports,
                Err(ControlError::NotConnected(id)) => {
                    return Err(ControlError::NotConnected(id).into())
                }
                Err(e) => {
                    debug!(node_id, "Port suggestions unavailable: {}", e);
                    return Ok(None);
                }
            };

            if let Some(port) = ports
                .iter()
                .copied()
                .find(|p| range.contains(*p) && !used.contains(p))
            {
                return Ok(Some(port));
            }

            match ports.iter().copied().max() {
                Some(highest) if highest < range.max => base = highest + 1,
                _ => break,
            }
        }
        Ok(None)
    }

    async fn from_probes(
        &self,
        node_id: NodeId,
        range: &PortRange,
        used: &HashSet<u16>,
    ) -> Result<Option<u16>> {
        let mut probes = 0;
        for port in range.candidates() {
            if used.contains(&port) {
                continue;
            }
            if probes >= self.probe_budget {
                debug!(node_id, "Probe budget exhausted");
                break;
            }
            probes += 1;
            match self.rpc.probe_port(node_id, port).await {
                Ok(false) => return Ok(Some(port)),
                Ok(true) => continue,
                Err(ControlError::NotConnected(id)) => {
                    return Err(ControlError::NotConnected(id).into())
                }
                Err(e) => debug!(node_id, port, "Probe failed: {}", e),
            }
        }
        Ok(None)
    }
}
