//! In-memory store with optional JSON file persistence
//!
//! Mutations mark the store dirty; [`MemoryStore::flush`] writes the state
//! file atomically (tmp file + rename) only when something changed, so a
//! periodic flush task costs nothing on an idle panel.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hopwire_core::{
    DisconnectRecord, Forward, ForwardId, ForwardMidPort, Node, NodeId, NodeStatus, OperationLog,
    Tunnel, TunnelId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Result, Store, StoreError};

/// Audit entries kept in memory
const MAX_OPERATION_LOGS: usize = 10_000;

/// Disconnect records kept; the oldest closed ones go first
const MAX_DISCONNECT_RECORDS: usize = 10_000;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryState {
    nodes: BTreeMap<NodeId, Node>,
    tunnels: BTreeMap<TunnelId, Tunnel>,
    forwards: BTreeMap<ForwardId, Forward>,
    mid_ports: BTreeMap<ForwardId, BTreeMap<usize, ForwardMidPort>>,
    config: BTreeMap<String, String>,
    disconnects: Vec<DisconnectRecord>,
    next_disconnect_id: i64,
    /// Last ids handed out; never lowered by deletes
    #[serde(default)]
    next_node_id: i64,
    #[serde(default)]
    next_tunnel_id: i64,
    #[serde(default)]
    next_forward_id: i64,
    #[serde(skip)]
    operation_logs: VecDeque<OperationLog>,
    #[serde(skip)]
    system_info: HashMap<NodeId, serde_json::Value>,
}

/// Id for a row saved with `id`: a fresh one from `last` when zero.
///
/// `last` also covers rows loaded from state files written before the
/// counters existed.
fn assign_id<V>(last: &mut i64, map: &BTreeMap<i64, V>, id: i64) -> i64 {
    let highest = map.keys().next_back().copied().unwrap_or(0);
    *last = (*last).max(highest).max(id);
    if id != 0 {
        return id;
    }
    *last += 1;
    *last
}

/// Append `record`, evicting the oldest closed record once `cap` is reached
fn push_capped(records: &mut Vec<DisconnectRecord>, record: DisconnectRecord, cap: usize) {
    if records.len() >= cap {
        match records.iter().position(|r| !r.is_open()) {
            Some(oldest) => {
                records.remove(oldest);
            }
            None => {
                records.remove(0);
            }
        }
    }
    records.push(record);
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store (tests, dry runs)
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Store backed by a JSON state file; loads it when it exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let state: MemoryState = serde_json::from_str(&contents)?;
                debug!(
                    "Loaded state: {} nodes, {} tunnels, {} forwards from {}",
                    state.nodes.len(),
                    state.tunnels.len(),
                    state.forwards.len(),
                    path.display()
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Write the state file if anything changed since the last flush.
    ///
    /// Returns whether a write happened.
    pub fn flush(&self) -> Result<bool> {
        let Some(ref path) = self.path else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let json = {
            let state = self.state.read();
            serde_json::to_string_pretty(&*state)?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        let written = std::fs::write(&tmp_path, &json).and_then(|_| std::fs::rename(&tmp_path, path));
        if let Err(e) = written {
            // Keep the dirty flag so the next flush retries
            self.dirty.store(true, Ordering::Release);
            warn!("Failed to write state file {}: {}", path.display(), e);
            return Err(e.into());
        }

        debug!("Flushed state to {}", path.display());
        Ok(true)
    }

    fn write<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let out = f(&mut self.state.write());
        self.dirty.store(true, Ordering::Release);
        out
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.state.read().nodes.get(&id).cloned())
    }

    async fn node_by_secret(&self, secret: &str) -> Result<Option<Node>> {
        if secret.is_empty() {
            return Ok(None);
        }
        Ok(self
            .state
            .read()
            .nodes
            .values()
            .find(|n| n.secret == secret)
            .cloned())
    }

    async fn nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.read().nodes.values().cloned().collect())
    }

    async fn save_node(&self, mut node: Node) -> Result<Node> {
        self.write(|state| {
            let clash = state
                .nodes
                .values()
                .any(|n| n.id != node.id && !node.secret.is_empty() && n.secret == node.secret);
            if clash {
                return Err(StoreError::Conflict(format!("node secret already used: {}", node.name)));
            }
            node.id = assign_id(&mut state.next_node_id, &state.nodes, node.id);
            state.nodes.insert(node.id, node.clone());
            Ok(node)
        })
    }

    async fn set_node_status(
        &self,
        id: NodeId,
        status: NodeStatus,
        version: Option<String>,
    ) -> Result<()> {
        self.write(|state| {
            let node = state
                .nodes
                .get_mut(&id)
                .ok_or(StoreError::NotFound { kind: "node", id })?;
            node.status = status;
            if version.is_some() {
                node.version = version;
            }
            Ok(())
        })
    }

    async fn tunnel(&self, id: TunnelId) -> Result<Option<Tunnel>> {
        Ok(self.state.read().tunnels.get(&id).cloned())
    }

    async fn tunnels(&self) -> Result<Vec<Tunnel>> {
        Ok(self.state.read().tunnels.values().cloned().collect())
    }

    async fn save_tunnel(&self, mut tunnel: Tunnel) -> Result<Tunnel> {
        Ok(self.write(|state| {
            tunnel.id = assign_id(&mut state.next_tunnel_id, &state.tunnels, tunnel.id);
            state.tunnels.insert(tunnel.id, tunnel.clone());
            tunnel
        }))
    }

    async fn forward(&self, id: ForwardId) -> Result<Option<Forward>> {
        Ok(self.state.read().forwards.get(&id).cloned())
    }

    async fn forwards(&self) -> Result<Vec<Forward>> {
        Ok(self.state.read().forwards.values().cloned().collect())
    }

    async fn forwards_by_tunnel(&self, tunnel_id: TunnelId) -> Result<Vec<Forward>> {
        Ok(self
            .state
            .read()
            .forwards
            .values()
            .filter(|f| f.tunnel_id == tunnel_id)
            .cloned()
            .collect())
    }

    async fn save_forward(&self, mut forward: Forward) -> Result<Forward> {
        Ok(self.write(|state| {
            forward.id = assign_id(&mut state.next_forward_id, &state.forwards, forward.id);
            state.forwards.insert(forward.id, forward.clone());
            forward
        }))
    }

    async fn delete_forward(&self, id: ForwardId) -> Result<()> {
        self.write(|state| {
            state.forwards.remove(&id);
            state.mid_ports.remove(&id);
        });
        Ok(())
    }

    async fn mid_ports(&self, forward_id: ForwardId) -> Result<Vec<ForwardMidPort>> {
        Ok(self
            .state
            .read()
            .mid_ports
            .get(&forward_id)
            .map(|hops| hops.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_mid_port(&self, mid: ForwardMidPort) -> Result<()> {
        self.write(|state| {
            state
                .mid_ports
                .entry(mid.forward_id)
                .or_default()
                .insert(mid.idx, mid);
        });
        Ok(())
    }

    async fn delete_mid_ports(&self, forward_id: ForwardId) -> Result<()> {
        self.write(|state| {
            state.mid_ports.remove(&forward_id);
        });
        Ok(())
    }

    async fn config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.read().config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: String) -> Result<()> {
        self.write(|state| {
            state.config.insert(key.to_string(), value);
        });
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<()> {
        self.write(|state| {
            state.config.remove(key);
        });
        Ok(())
    }

    async fn open_disconnect(&self, node_id: NodeId, at: i64) -> Result<DisconnectRecord> {
        Ok(self.write(|state| {
            if let Some(open) = state
                .disconnects
                .iter()
                .find(|r| r.node_id == node_id && r.is_open())
            {
                return open.clone();
            }
            state.next_disconnect_id += 1;
            let record = DisconnectRecord {
                id: state.next_disconnect_id,
                node_id,
                down_at: at,
                up_at: None,
                duration_secs: None,
            };
            push_capped(&mut state.disconnects, record.clone(), MAX_DISCONNECT_RECORDS);
            record
        }))
    }

    async fn close_disconnect(&self, node_id: NodeId, at: i64) -> Result<Option<DisconnectRecord>> {
        Ok(self.write(|state| {
            let record = state
                .disconnects
                .iter_mut()
                .rev()
                .find(|r| r.node_id == node_id && r.is_open())?;
            record.up_at = Some(at);
            record.duration_secs = Some(((at - record.down_at) / 1000).max(0));
            Some(record.clone())
        }))
    }

    async fn disconnects(&self, node_id: NodeId) -> Result<Vec<DisconnectRecord>> {
        Ok(self
            .state
            .read()
            .disconnects
            .iter()
            .filter(|r| r.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn append_operation_log(&self, log: OperationLog) -> Result<()> {
        let mut state = self.state.write();
        if state.operation_logs.len() >= MAX_OPERATION_LOGS {
            state.operation_logs.pop_front();
        }
        state.operation_logs.push_back(log);
        Ok(())
    }

    async fn operation_logs(&self, node_id: NodeId) -> Result<Vec<OperationLog>> {
        Ok(self
            .state
            .read()
            .operation_logs
            .iter()
            .filter(|l| l.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn record_system_info(&self, node_id: NodeId, info: serde_json::Value) -> Result<()> {
        self.state.write().system_info.insert(node_id, info);
        Ok(())
    }

    async fn system_info(&self, node_id: NodeId) -> Result<Option<serde_json::Value>> {
        Ok(self.state.read().system_info.get(&node_id).cloned())
    }
}
