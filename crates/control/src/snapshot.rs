//! Per-node service self-report cache

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hopwire_core::NodeId;
use hopwire_protocol::ServiceReport;
use parking_lot::RwLock;

/// What a node last said it is running
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// Service name to content hash
    pub services: HashMap<String, String>,
    pub taken_at: Instant,
}

impl NodeSnapshot {
    pub fn from_report(report: &ServiceReport, taken_at: Instant) -> Self {
        Self {
            services: report
                .services
                .iter()
                .map(|s| (s.name.clone(), s.hash.clone()))
                .collect(),
            taken_at,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn hash(&self, name: &str) -> Option<&str> {
        self.services
            .get(name)
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }

    pub fn is_fresh(&self, staleness: Duration) -> bool {
        self.taken_at.elapsed() <= staleness
    }
}

pub struct SnapshotCache {
    nodes: RwLock<HashMap<NodeId, NodeSnapshot>>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, node_id: NodeId, report: &ServiceReport) {
        self.insert(node_id, NodeSnapshot::from_report(report, Instant::now()));
    }

    pub fn insert(&self, node_id: NodeId, snapshot: NodeSnapshot) {
        self.nodes.write().insert(node_id, snapshot);
    }

    /// The node's snapshot, if younger than `staleness`
    pub fn fresh(&self, node_id: NodeId, staleness: Duration) -> Option<NodeSnapshot> {
        self.nodes
            .read()
            .get(&node_id)
            .filter(|s| s.is_fresh(staleness))
            .cloned()
    }

    pub fn remove(&self, node_id: NodeId) {
        self.nodes.write().remove(&node_id);
    }
}
