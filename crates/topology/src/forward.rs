//! Forward orchestration
//!
//! Every mutation resolves a plan, assigns ports, builds the hop services and
//! pushes them one hop at a time in construction order. Pushes are not
//! transactional: a failing hop shows up in the per-hop results and in the
//! operation log while earlier hops keep what they received.
//!
//! A hop gets `UpdateService` only when its node accepted the same service
//! on an earlier deploy ([`DeployedHops`]); new, moved and previously failed
//! hops get `AddService`.

use std::collections::BTreeMap;

use hopwire_control::{ControlError, ControlPlane, PushKind};
use hopwire_core::{
    now_millis, parse_remote_addrs, Forward, ForwardId, ForwardMidPort, ForwardStatus,
    LimiterConfig, NewForward, NodeId, OperationLog, TunnelId,
};
use hopwire_protocol::{DiagnoseKind, OperationOutcome};
use hopwire_store::Store;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allocator::{PortAllocator, PortRange};
use crate::builder::{build_services, limiter_name, HopPorts, HopService, TopologySettings};
use crate::drift::{DriftReconciler, ForwardHealth};
use crate::plan::{DeployedHops, Hop, HopRole, TopologyPlan, TunnelLayout};
use crate::{Result, TopologyError};

/// Outcome of one hop's push
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HopResult {
    pub index: usize,
    pub node_id: NodeId,
    pub service: String,
    pub success: bool,
    pub message: String,
}

impl HopResult {
    fn new(
        index: usize,
        node_id: NodeId,
        service: String,
        outcome: std::result::Result<OperationOutcome, ControlError>,
    ) -> Self {
        let (success, message) = match outcome {
            Ok(outcome) => (outcome.success, outcome.message),
            Err(e) => (false, e.to_string()),
        };
        Self {
            index,
            node_id,
            service,
            success,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardOutcome {
    pub forward: Forward,
    pub hops: Vec<HopResult>,
}

impl ForwardOutcome {
    /// Whether every hop accepted its service
    pub fn success(&self) -> bool {
        self.hops.iter().all(|h| h.success)
    }
}

/// Field changes for [`ForwardService::update`]; absent fields are kept
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardUpdate {
    #[serde(default)]
    pub name: Option<String>,
    /// New entry port, checked against the entry node's range
    #[serde(default)]
    pub in_port: Option<u16>,
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// An empty string clears the interface
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    /// Zero detaches the limiter
    #[serde(default)]
    pub speed_limit_id: Option<i64>,
}

impl ForwardUpdate {
    fn apply(self, forward: &mut Forward) {
        if let Some(name) = self.name {
            forward.name = name;
        }
        if let Some(remote_addr) = self.remote_addr {
            forward.remote_addr = remote_addr;
        }
        if let Some(iface) = self.interface_name {
            forward.interface_name = Some(iface).filter(|i| !i.is_empty());
        }
        if let Some(strategy) = self.strategy {
            forward.strategy = Some(strategy).filter(|s| !s.is_empty());
        }
        if let Some(limit) = self.speed_limit_id {
            forward.speed_limit_id = Some(limit).filter(|l| *l > 0);
        }
    }
}

/// One hop's reachability check of the address it forwards to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HopDiagnosis {
    pub index: usize,
    pub node_id: NodeId,
    pub target: String,
    pub reachable: bool,
    pub average_ms: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
enum NameOp {
    Delete,
    Pause,
    Resume,
}

impl NameOp {
    fn command(&self) -> &'static str {
        match self {
            NameOp::Delete => "DeleteService",
            NameOp::Pause => "PauseService",
            NameOp::Resume => "ResumeService",
        }
    }
}

fn push_command(kind: PushKind) -> &'static str {
    match kind {
        PushKind::Add => "AddService",
        PushKind::Update => "UpdateService",
    }
}

/// Creates, changes and inspects forwards across their hops
#[derive(Clone)]
pub struct ForwardService {
    control: ControlPlane,
    settings: TopologySettings,
}

impl ForwardService {
    pub fn new(control: ControlPlane, settings: TopologySettings) -> Self {
        Self { control, settings }
    }

    pub fn settings(&self) -> &TopologySettings {
        &self.settings
    }

    fn store(&self) -> &dyn Store {
        self.control.store.as_ref()
    }

    pub async fn forward(&self, id: ForwardId) -> Result<Forward> {
        self.store()
            .forward(id)
            .await?
            .ok_or(TopologyError::ForwardNotFound(id))
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Allocate ports, persist the forward and push it hop by hop.
    ///
    /// Allocation happens before anything is stored; a `PortExhausted` leaves
    /// no record behind.
    pub async fn create(&self, request: NewForward) -> Result<ForwardOutcome> {
        let tunnel = self
            .store()
            .tunnel(request.tunnel_id)
            .await?
            .ok_or(TopologyError::TunnelNotFound(request.tunnel_id))?;

        let forward = Forward {
            id: 0,
            user_id: request.user_id,
            user_tunnel_id: request.user_tunnel_id,
            tunnel_id: tunnel.id,
            name: request.name,
            in_port: 0,
            out_port: None,
            remote_addr: request.remote_addr,
            interface_name: request.interface_name.filter(|i| !i.is_empty()),
            strategy: request.strategy.filter(|s| !s.is_empty()),
            speed_limit_id: request.speed_limit_id.filter(|l| *l > 0),
            status: ForwardStatus::Active,
            in_flow: 0,
            out_flow: 0,
            created_at: now_millis(),
        };

        let outcome = self.deploy(forward, request.in_port).await?;
        info!(
            forward_id = outcome.forward.id,
            in_port = outcome.forward.in_port,
            "Created forward ({} hops)",
            outcome.hops.len()
        );
        Ok(outcome)
    }

    /// Apply `changes` and push every hop again
    pub async fn update(&self, id: ForwardId, changes: ForwardUpdate) -> Result<ForwardOutcome> {
        let mut forward = self.forward(id).await?;
        let in_port = changes.in_port.filter(|p| *p != forward.in_port);
        changes.apply(&mut forward);
        parse_remote_addrs(&forward.remote_addr)
            .map_err(|e| TopologyError::InvalidTopology(e.to_string()))?;
        self.deploy(forward, in_port).await
    }

    /// Rebuild from persisted state and push every hop again
    pub async fn redeploy(&self, id: ForwardId) -> Result<ForwardOutcome> {
        let forward = self.forward(id).await?;
        self.deploy(forward, None).await
    }

    /// Remove the services from every hop, then the forward record.
    ///
    /// Services recorded on nodes that have since left the plan are removed
    /// as well.
    pub async fn delete(&self, id: ForwardId) -> Result<Vec<HopResult>> {
        let forward = self.forward(id).await?;
        let mut deployed = DeployedHops::load(self.store(), id).await?;
        let results = match TopologyPlan::load(self.store(), forward).await {
            Ok(plan) => {
                for hop in &plan.hops {
                    let name = plan.service_name(hop);
                    if deployed.holds(&name, hop.node.id) {
                        deployed.forget(&name);
                    }
                }
                self.for_each_hop(&plan, NameOp::Delete).await
            }
            Err(e) => {
                warn!(forward_id = id, "Cannot resolve hops, deleting recorded services only: {}", e);
                Vec::new()
            }
        };
        self.retire(id, &deployed).await;
        DeployedHops::clear(self.store(), id).await?;
        self.store().delete_forward(id).await?;
        info!(forward_id = id, "Deleted forward");
        Ok(results)
    }

    pub async fn pause(&self, id: ForwardId) -> Result<Vec<HopResult>> {
        self.set_status(id, ForwardStatus::Paused, NameOp::Pause).await
    }

    pub async fn resume(&self, id: ForwardId) -> Result<Vec<HopResult>> {
        self.set_status(id, ForwardStatus::Active, NameOp::Resume).await
    }

    async fn set_status(
        &self,
        id: ForwardId,
        status: ForwardStatus,
        op: NameOp,
    ) -> Result<Vec<HopResult>> {
        let mut forward = self.forward(id).await?;
        let plan = TopologyPlan::load(self.store(), forward.clone()).await?;
        let results = self.for_each_hop(&plan, op).await;
        forward.status = status;
        self.store().save_forward(forward).await?;
        Ok(results)
    }

    // ── Inspection ────────────────────────────────────────────

    /// Read-only drift check of every hop
    pub async fn status(&self, id: ForwardId) -> Result<ForwardHealth> {
        let forward = self.forward(id).await?;
        let plan = TopologyPlan::load(self.store(), forward).await?;
        let ports = self.persisted_ports(&plan).await?;
        let reconciler = DriftReconciler::new(
            &self.control.rpc,
            &self.control.snapshots,
            self.control.config.snapshot_staleness,
        );
        reconciler.check(&plan, &ports, &self.settings).await
    }

    /// Ask every hop's node to reach the address(es) it forwards to
    pub async fn diagnose(&self, id: ForwardId) -> Result<Vec<HopDiagnosis>> {
        let forward = self.forward(id).await?;
        let plan = TopologyPlan::load(self.store(), forward).await?;
        let ports = self.persisted_ports(&plan).await?;
        let services = build_services(&plan, &ports, &self.settings)?;

        let mut results = Vec::new();
        for hop in &services {
            for target in next_targets(hop) {
                let report = self
                    .control
                    .rpc
                    .diagnose(hop.node_id, &target, DiagnoseKind::Tcp)
                    .await;
                let diagnosis = match report {
                    Ok(report) => HopDiagnosis {
                        index: hop.index,
                        node_id: hop.node_id,
                        target,
                        reachable: report.reachable,
                        average_ms: report.average_ms,
                        message: report.message,
                    },
                    Err(e) => HopDiagnosis {
                        index: hop.index,
                        node_id: hop.node_id,
                        target,
                        reachable: false,
                        average_ms: None,
                        message: e.to_string(),
                    },
                };
                results.push(diagnosis);
            }
        }
        Ok(results)
    }

    /// Push the forward's limiter definition to its entry node
    pub async fn sync_limiter(&self, id: ForwardId, limits: Vec<String>) -> Result<HopResult> {
        let forward = self.forward(id).await?;
        let limit_id = forward.speed_limit_id.ok_or_else(|| {
            TopologyError::InvalidTopology(format!("forward {} has no speed limit", id))
        })?;
        let plan = TopologyPlan::load(self.store(), forward).await?;
        let entry = plan.entry();
        let name = limiter_name(limit_id);

        let outcome = self
            .control
            .rpc
            .upsert_limiters(
                entry.node.id,
                vec![LimiterConfig {
                    name: name.clone(),
                    limits,
                }],
            )
            .await;
        let result = HopResult::new(entry.index, entry.node.id, name, outcome);
        self.audit(id, "UpsertLimiters", result.node_id, result.success, &result.message)
            .await;
        Ok(result)
    }

    // ── Tunnel layout ─────────────────────────────────────────

    /// Path, bind and interface overrides of a tunnel
    pub async fn layout(&self, tunnel_id: TunnelId) -> Result<TunnelLayout> {
        self.require_tunnel(tunnel_id).await?;
        TunnelLayout::load(self.store(), tunnel_id).await
    }

    /// Replace a tunnel's intermediate path.
    ///
    /// Existing forwards keep running on the old path until redeployed.
    pub async fn set_path(&self, tunnel_id: TunnelId, path: Vec<NodeId>) -> Result<()> {
        let tunnel = self.require_tunnel(tunnel_id).await?;
        let mut seen = Vec::with_capacity(path.len());
        for id in &path {
            if *id == tunnel.in_node_id || Some(*id) == tunnel.out_node_id {
                return Err(TopologyError::InvalidTopology(format!(
                    "node {} is already an endpoint of tunnel {}",
                    id, tunnel_id
                )));
            }
            if seen.contains(id) {
                return Err(TopologyError::InvalidTopology(format!(
                    "node {} appears twice in path",
                    id
                )));
            }
            self.store()
                .node(*id)
                .await?
                .ok_or(TopologyError::NodeNotFound(*id))?;
            seen.push(*id);
        }
        TunnelLayout::save_path(self.store(), tunnel_id, &path).await?;
        debug!(tunnel_id, "Saved path {:?}", path);
        Ok(())
    }

    pub async fn set_bind_map(
        &self,
        tunnel_id: TunnelId,
        bind: BTreeMap<NodeId, String>,
    ) -> Result<()> {
        self.require_tunnel(tunnel_id).await?;
        let bind: BTreeMap<NodeId, String> = bind.into_iter().filter(|(_, ip)| !ip.is_empty()).collect();
        TunnelLayout::save_bind(self.store(), tunnel_id, &bind).await
    }

    pub async fn set_iface_map(
        &self,
        tunnel_id: TunnelId,
        iface: BTreeMap<NodeId, String>,
    ) -> Result<()> {
        self.require_tunnel(tunnel_id).await?;
        let iface: BTreeMap<NodeId, String> = iface.into_iter().filter(|(_, i)| !i.is_empty()).collect();
        TunnelLayout::save_iface(self.store(), tunnel_id, &iface).await
    }

    async fn require_tunnel(&self, tunnel_id: TunnelId) -> Result<hopwire_core::Tunnel> {
        self.store()
            .tunnel(tunnel_id)
            .await?
            .ok_or(TopologyError::TunnelNotFound(tunnel_id))
    }

    // ── Internals ─────────────────────────────────────────────

    /// Assign ports, persist, build and push
    async fn deploy(
        &self,
        forward: Forward,
        requested_in_port: Option<u16>,
    ) -> Result<ForwardOutcome> {
        let mut plan = TopologyPlan::load(self.store(), forward).await?;
        let existing = plan.forward.id != 0;
        let (persisted, mut deployed) = if existing {
            (
                self.store().mid_ports(plan.forward.id).await?,
                DeployedHops::load(self.store(), plan.forward.id).await?,
            )
        } else {
            (Vec::new(), DeployedHops::default())
        };

        let ports = self.assign_ports(&mut plan, &persisted, requested_in_port).await?;

        plan.forward.in_port = ports.entry;
        plan.forward.out_port = ports.exit;
        plan.forward = self.store().save_forward(plan.forward.clone()).await?;
        let forward_id = plan.forward.id;

        if existing {
            self.retire_moved(&plan, &mut deployed).await;
            self.store().delete_mid_ports(forward_id).await?;
        }
        for (hop, port) in plan.mids().zip(&ports.mids) {
            if let HopRole::Mid { path_index } = hop.role {
                self.store()
                    .upsert_mid_port(ForwardMidPort {
                        forward_id,
                        idx: path_index,
                        node_id: hop.node.id,
                        port: *port,
                    })
                    .await?;
            }
        }

        let services = build_services(&plan, &ports, &self.settings)?;
        let hops = self.push(forward_id, services, &mut deployed).await;
        deployed.save(self.store(), forward_id).await?;
        Ok(ForwardOutcome {
            forward: plan.forward,
            hops,
        })
    }

    /// Ports for every hop. Ports already recorded on the forward and mid
    /// ports persisted for the same node are kept; the rest are allocated.
    async fn assign_ports(
        &self,
        plan: &mut TopologyPlan,
        persisted: &[ForwardMidPort],
        requested_in_port: Option<u16>,
    ) -> Result<HopPorts> {
        let mut allocator =
            PortAllocator::new(&self.control.rpc).with_probe_budget(self.settings.probe_budget);
        if plan.forward.id != 0 {
            allocator = allocator.with_owner(plan.base_name());
        }

        let entry = plan.entry().clone();
        let entry_port = match requested_in_port {
            Some(port) => {
                if !entry.node.in_range(port) {
                    return Err(TopologyError::InvalidTopology(format!(
                        "port {} outside {}..={} of node {}",
                        port, entry.node.port_sta, entry.node.port_end, entry.node.id
                    )));
                }
                let exact = PortRange { min: port, max: port, base: port };
                allocator.allocate(entry.node.id, exact).await?
            }
            None if plan.forward.in_port != 0 => {
                allocator.reserve(entry.node.id, plan.forward.in_port);
                plan.forward.in_port
            }
            None => {
                let range = PortRange::public(&entry.node, entry.node.port_sta);
                allocator.allocate(entry.node.id, range).await?
            }
        };
        plan.forward.in_port = entry_port;

        let exit_port = match plan.exit().cloned() {
            Some(exit) => match plan.forward.out_port.filter(|p| *p != 0) {
                Some(port) => {
                    allocator.reserve(exit.node.id, port);
                    Some(port)
                }
                None => {
                    let prev = &plan.hops[exit.index - 1];
                    let range = PortRange::for_hop(
                        &exit.node,
                        prev.dial_host(),
                        exit.dial_host(),
                        exit.node.port_sta,
                    );
                    Some(allocator.allocate(exit.node.id, range).await?)
                }
            },
            None => None,
        };

        let mids: Vec<Hop> = plan.mids().cloned().collect();
        let mut mid_ports = Vec::with_capacity(mids.len());
        for hop in &mids {
            let HopRole::Mid { path_index } = hop.role else {
                continue;
            };
            let kept = persisted
                .iter()
                .find(|m| m.idx == path_index && m.node_id == hop.node.id && m.port != 0);
            let port = match kept {
                Some(mid) => {
                    allocator.reserve(hop.node.id, mid.port);
                    mid.port
                }
                None => {
                    let prev = &plan.hops[hop.index - 1];
                    let range = PortRange::for_hop(
                        &hop.node,
                        prev.dial_host(),
                        hop.dial_host(),
                        entry_port,
                    );
                    allocator.allocate(hop.node.id, range).await?
                }
            };
            mid_ports.push(port);
        }

        Ok(HopPorts {
            entry: entry_port,
            mids: mid_ports,
            exit: exit_port,
        })
    }

    /// Ports as recorded, without allocating
    async fn persisted_ports(&self, plan: &TopologyPlan) -> Result<HopPorts> {
        let persisted = self.store().mid_ports(plan.forward.id).await?;
        let mids = plan
            .mids()
            .map(|hop| match hop.role {
                HopRole::Mid { path_index } => persisted
                    .iter()
                    .find(|m| m.idx == path_index && m.node_id == hop.node.id)
                    .map_or(0, |m| m.port),
                _ => 0,
            })
            .collect();
        Ok(HopPorts {
            entry: plan.forward.in_port,
            mids,
            exit: plan.forward.out_port,
        })
    }

    /// Delete services whose hop moved to another node or left the plan
    async fn retire_moved(&self, plan: &TopologyPlan, deployed: &mut DeployedHops) {
        let mut moved = DeployedHops::default();
        for (name, node_id) in deployed.iter() {
            let kept = plan
                .hops
                .iter()
                .any(|hop| hop.node.id == node_id && plan.service_name(hop) == name);
            if !kept {
                moved.record(name.to_string(), node_id);
            }
        }
        for (name, _) in moved.iter() {
            deployed.forget(name);
        }
        self.retire(plan.forward.id, &moved).await;
    }

    /// Best-effort delete of recorded services
    async fn retire(&self, forward_id: ForwardId, services: &DeployedHops) {
        for (name, node_id) in services.iter() {
            let names = [name.to_string()];
            let (success, message) = match self.control.rpc.delete_services(node_id, &names).await {
                Ok(outcome) => (outcome.success, outcome.message),
                Err(e) => (false, e.to_string()),
            };
            debug!(forward_id, node_id, "Retired {}: {}", name, message);
            self.audit(forward_id, NameOp::Delete.command(), node_id, success, &message)
                .await;
        }
    }

    async fn push(
        &self,
        forward_id: ForwardId,
        services: Vec<HopService>,
        deployed: &mut DeployedHops,
    ) -> Vec<HopResult> {
        let mut results = Vec::with_capacity(services.len());
        for hop in services {
            let name = hop.service.name.clone();
            let kind = if deployed.holds(&name, hop.node_id) {
                PushKind::Update
            } else {
                PushKind::Add
            };
            let outcome = self
                .control
                .rpc
                .push_services(hop.node_id, kind, vec![hop.service])
                .await;
            let result = HopResult::new(hop.index, hop.node_id, name, outcome);
            if result.success {
                deployed.record(result.service.clone(), result.node_id);
            } else {
                warn!(
                    forward_id,
                    node_id = result.node_id,
                    hop = result.index,
                    "{} failed: {}",
                    push_command(kind),
                    result.message
                );
            }
            self.audit(
                forward_id,
                push_command(kind),
                result.node_id,
                result.success,
                &result.message,
            )
            .await;
            results.push(result);
        }
        results
    }

    async fn for_each_hop(&self, plan: &TopologyPlan, op: NameOp) -> Vec<HopResult> {
        let rpc = &self.control.rpc;
        let mut results = Vec::with_capacity(plan.hops.len());
        for hop in &plan.hops {
            let names = [plan.service_name(hop)];
            let outcome = match op {
                NameOp::Delete => rpc.delete_services(hop.node.id, &names).await,
                NameOp::Pause => rpc.pause_services(hop.node.id, &names).await,
                NameOp::Resume => rpc.resume_services(hop.node.id, &names).await,
            };
            let [name] = names;
            let result = HopResult::new(hop.index, hop.node.id, name, outcome);
            self.audit(
                plan.forward.id,
                op.command(),
                result.node_id,
                result.success,
                &result.message,
            )
            .await;
            results.push(result);
        }
        results
    }

    async fn audit(
        &self,
        forward_id: ForwardId,
        command: &str,
        node_id: NodeId,
        success: bool,
        message: &str,
    ) {
        let log = OperationLog {
            node_id,
            command: command.to_string(),
            forward_id: Some(forward_id),
            success,
            message: message.to_string(),
            at: now_millis(),
        };
        if let Err(e) = self.store().append_operation_log(log).await {
            warn!(node_id, "Failed to record {}: {}", command, e);
        }
    }
}

/// Addresses a hop's service dials
fn next_targets(hop: &HopService) -> Vec<String> {
    if let Some(chain) = &hop.service.chain {
        return chain
            .hops
            .iter()
            .flat_map(|h| h.nodes.iter().map(|n| n.addr.clone()))
            .collect();
    }
    hop.service
        .forwarder
        .as_ref()
        .map(|f| f.nodes.iter().map(|n| n.addr.clone()).collect())
        .unwrap_or_default()
}
