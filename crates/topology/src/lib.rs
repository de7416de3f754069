//! hopwire Topology
//!
//! Turns a forward (one entry point, one or more remote targets) into a
//! concrete chain of per-node services and keeps an eye on it afterwards.
//!
//! ## Flow
//!
//! 1. [`TopologyPlan`] orders the hops: entry, tunnel path, relay exit
//! 2. [`PortAllocator`] finds free ports for intermediate hops
//! 3. [`build_services`] derives one service per hop (pure)
//! 4. [`ForwardService`] pushes them hop by hop and reports per-hop results
//! 5. [`DriftReconciler`] compares expected hops with what nodes run

mod allocator;
mod builder;
mod drift;
mod forward;
mod plan;

pub use allocator::{PortAllocator, PortRange, DEFAULT_PROBE_BUDGET};
pub use builder::{
    build_services, limiter_name, relay_credentials, HopPorts, HopService, TopologySettings,
};
pub use drift::{metadata_subset, CheckSource, DriftReconciler, ForwardHealth, HopHealth};
pub use forward::{ForwardOutcome, ForwardService, ForwardUpdate, HopDiagnosis, HopResult};
pub use plan::{
    bind_key, deployed_key, iface_key, path_key, DeployedHops, Hop, HopRole, TopologyPlan,
    TunnelLayout,
};

use hopwire_control::ControlError;
use hopwire_core::{ForwardId, NodeId, TunnelId};
use hopwire_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    /// Nothing free was found in the range. Without agent suggestions only
    /// the first `probe_budget` candidates are probed, so a wide range can
    /// still hold free ports past that point.
    #[error("No free port on node {node_id} in {min}..={max}")]
    PortExhausted { node_id: NodeId, min: u16, max: u16 },

    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Tunnel {0} not found")]
    TunnelNotFound(TunnelId),

    #[error("Forward {0} not found")]
    ForwardNotFound(ForwardId),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TopologyError>;
