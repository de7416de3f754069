//! Drift reconciliation
//!
//! Read-only: compares what each hop of a forward should run against what
//! its node reports, from a fresh self-report when one matches, otherwise
//! from a live query.

use std::collections::BTreeMap;
use std::time::Duration;

use hopwire_control::{AgentRpc, ControlError, SnapshotCache};
use hopwire_core::{ForwardId, NodeId};
use hopwire_protocol::ServiceStatus;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::builder::{build_services, HopPorts, HopService, TopologySettings};
use crate::plan::{HopRole, TopologyPlan};
use crate::Result;

/// Where a hop's verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSource {
    Snapshot,
    Live,
    /// Nothing could be checked (missing port, node unreachable)
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HopHealth {
    pub index: usize,
    pub node_id: NodeId,
    pub service: String,
    pub expected_port: Option<u16>,
    pub actual_port: Option<u16>,
    pub listening: Option<bool>,
    pub metadata_ok: bool,
    pub healthy: bool,
    pub source: CheckSource,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardHealth {
    pub forward_id: ForwardId,
    pub healthy: bool,
    pub hops: Vec<HopHealth>,
}

impl ForwardHealth {
    pub fn unhealthy_hops(&self) -> impl Iterator<Item = &HopHealth> {
        self.hops.iter().filter(|h| !h.healthy)
    }
}

/// Whether every declared key is present with the same value in `actual`
pub fn metadata_subset(declared: &BTreeMap<String, Value>, actual: &BTreeMap<String, Value>) -> bool {
    declared.iter().all(|(k, v)| actual.get(k) == Some(v))
}

pub struct DriftReconciler<'a> {
    rpc: &'a AgentRpc,
    snapshots: &'a SnapshotCache,
    staleness: Duration,
}

impl<'a> DriftReconciler<'a> {
    pub fn new(rpc: &'a AgentRpc, snapshots: &'a SnapshotCache, staleness: Duration) -> Self {
        Self {
            rpc,
            snapshots,
            staleness,
        }
    }

    /// Check every hop of `plan` against the persisted ports
    pub async fn check(
        &self,
        plan: &TopologyPlan,
        ports: &HopPorts,
        settings: &TopologySettings,
    ) -> Result<ForwardHealth> {
        // Hops without a recorded port are built with a placeholder and
        // reported unhealthy without querying the node
        let mut dry = ports.clone();
        dry.mids.resize(plan.mid_count(), 0);
        let placeholders: Vec<bool> = plan.hops.iter().map(|h| ports.for_hop(h).is_none()).collect();
        for (i, hop) in plan.hops.iter().enumerate() {
            if placeholders[i] {
                match hop.role {
                    HopRole::Mid { path_index } => dry.mids[path_index] = u16::MAX,
                    HopRole::Exit => dry.exit = Some(u16::MAX),
                    HopRole::Entry => {}
                }
            }
        }
        let expected = build_services(plan, &dry, settings)?;

        let mut hops = Vec::with_capacity(expected.len());
        for (hop, missing_port) in expected.iter().zip(placeholders) {
            let health = if missing_port {
                HopHealth {
                    index: hop.index,
                    node_id: hop.node_id,
                    service: hop.service.name.clone(),
                    expected_port: None,
                    actual_port: None,
                    listening: None,
                    metadata_ok: false,
                    healthy: false,
                    source: CheckSource::None,
                    message: "no port recorded for hop".to_string(),
                }
            } else {
                self.check_hop(hop).await
            };
            hops.push(health);
        }

        Ok(ForwardHealth {
            forward_id: plan.forward.id,
            healthy: hops.iter().all(|h| h.healthy),
            hops,
        })
    }

    async fn check_hop(&self, hop: &HopService) -> HopHealth {
        let expected = &hop.service;
        let mut health = HopHealth {
            index: hop.index,
            node_id: hop.node_id,
            service: expected.name.clone(),
            expected_port: expected.port(),
            actual_port: None,
            listening: None,
            metadata_ok: false,
            healthy: false,
            source: CheckSource::Live,
            message: String::new(),
        };

        if let Some(snapshot) = self.snapshots.fresh(hop.node_id, self.staleness) {
            if snapshot.hash(&expected.name) == Some(expected.content_hash().as_str()) {
                health.source = CheckSource::Snapshot;
                health.actual_port = health.expected_port;
                health.listening = Some(true);
                health.metadata_ok = true;
                health.healthy = true;
                return health;
            }
            if !snapshot.contains(&expected.name) {
                health.source = CheckSource::Snapshot;
                health.message = "service not reported by node".to_string();
                return health;
            }
        }

        let actual = match self.live_service(hop.node_id, &expected.name).await {
            Ok(Some(actual)) => actual,
            Ok(None) => {
                health.message = "service not found on node".to_string();
                return health;
            }
            Err(e) => {
                health.source = CheckSource::None;
                health.message = e.to_string();
                return health;
            }
        };

        health.actual_port = actual.port();
        health.listening = match actual.listening {
            Some(listening) => Some(listening),
            None => match health.expected_port {
                Some(port) => self.rpc.probe_port(hop.node_id, port).await.ok(),
                None => None,
            },
        };
        health.metadata_ok = match hop.role {
            HopRole::Entry => metadata_subset(&expected.metadata, &actual.metadata),
            _ => true,
        };

        let mut problems = Vec::new();
        if health.actual_port != health.expected_port {
            problems.push(format!(
                "port {:?} != expected {:?}",
                health.actual_port, health.expected_port
            ));
        }
        if health.listening != Some(true) {
            problems.push("not listening".to_string());
        }
        if !health.metadata_ok {
            problems.push("metadata mismatch".to_string());
        }
        health.healthy = problems.is_empty();
        health.message = problems.join("; ");
        health
    }

    /// Exact-name lookup, falling back to a filtered listing for agents
    /// that do not answer `GetService`
    async fn live_service(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> std::result::Result<Option<ServiceStatus>, ControlError> {
        match self.rpc.get_service(node_id, name).await {
            Ok(found) => Ok(found),
            Err(e @ ControlError::NotConnected(_)) => Err(e),
            Err(e) => {
                debug!(node_id, service = name, "GetService failed, listing instead: {}", e);
                let services = self
                    .rpc
                    .query_services(node_id, Some(name.to_string()))
                    .await?;
                Ok(services.into_iter().find(|s| s.name == name))
            }
        }
    }
}
