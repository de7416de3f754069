//! Service construction
//!
//! Pure: the same plan, ports and settings always yield field-for-field
//! identical services, which is what drift checks compare against.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use hopwire_core::{
    join_host_port, AuthConfig, ChainConfig, ChainHop, ChainNode, ConnectorConfig, DialerConfig,
    Forward, ForwardTarget, ForwarderConfig, HandlerConfig, ListenerConfig, NodeId,
    ObserverConfig, PluginConfig, SelectorConfig, ServiceConfig, MANAGED_BY, MANAGED_BY_KEY,
};
use serde_json::Value;
use sha2::Sha256;

use crate::allocator::DEFAULT_PROBE_BUDGET;
use crate::plan::{Hop, HopRole, TopologyPlan};
use crate::{Result, TopologyError};

const FORWARD_TYPE: &str = "tcp";
const RELAY_TYPE: &str = "relay";
const DEFAULT_STRATEGY: &str = "fifo";
const OBSERVER_PERIOD: &str = "5s";
const PASSWORD_LEN: usize = 16;

/// Panel-wide inputs to service construction
#[derive(Debug, Clone)]
pub struct TopologySettings {
    /// Base URL agents report traffic to; observers are attached only when set
    pub panel_addr: Option<String>,
    pub observer_token: Option<String>,
    /// Key for relay password derivation
    pub credential_key: Option<String>,
    /// `ProbePort` round trips per port allocation
    pub probe_budget: usize,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            panel_addr: None,
            observer_token: None,
            credential_key: None,
            probe_budget: DEFAULT_PROBE_BUDGET,
        }
    }
}

/// Listening ports of every hop
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HopPorts {
    pub entry: u16,
    /// Indexed by path position
    pub mids: Vec<u16>,
    pub exit: Option<u16>,
}

impl HopPorts {
    pub fn for_hop(&self, hop: &Hop) -> Option<u16> {
        match hop.role {
            HopRole::Entry => Some(self.entry),
            HopRole::Mid { path_index } => self.mids.get(path_index).copied().filter(|p| *p != 0),
            HopRole::Exit => self.exit.filter(|p| *p != 0),
        }
    }
}

/// One hop's service, ready to push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopService {
    pub index: usize,
    pub node_id: NodeId,
    pub role: HopRole,
    pub service: ServiceConfig,
}

type HmacSha256 = Hmac<Sha256>;

/// Per-forward relay credentials.
///
/// The username comes from the forward id; the password is a truncated
/// HMAC of the forward id and creation time.
pub fn relay_credentials(forward: &Forward, key: Option<&str>) -> Result<AuthConfig> {
    let mut mac = HmacSha256::new_from_slice(key.unwrap_or_default().as_bytes())
        .map_err(|e| TopologyError::InvalidTopology(format!("credential key: {}", e)))?;
    mac.update(format!("{}:{}", forward.id, forward.created_at).as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());

    Ok(AuthConfig {
        username: format!("u{}", forward.id),
        password: digest[..PASSWORD_LEN].to_string(),
    })
}

fn port_for(ports: &HopPorts, hop: &Hop) -> Result<u16> {
    ports.for_hop(hop).ok_or_else(|| {
        TopologyError::InvalidTopology(format!(
            "no port assigned for hop {} on node {}",
            hop.index, hop.node.id
        ))
    })
}

fn forwarder(targets: &[String], strategy: Option<&str>) -> ForwarderConfig {
    let nodes = targets
        .iter()
        .enumerate()
        .map(|(i, addr)| ForwardTarget {
            name: format!("target-{}", i),
            addr: addr.clone(),
        })
        .collect();
    let selector = (targets.len() > 1).then(|| SelectorConfig {
        strategy: strategy
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_STRATEGY)
            .to_string(),
        max_fails: 1,
        fail_timeout: "10s".to_string(),
    });
    ForwarderConfig { nodes, selector }
}

fn managed_metadata() -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert(MANAGED_BY_KEY.to_string(), Value::from(MANAGED_BY));
    metadata
}

/// Interface pin: per-node override, else the forward's own hint on the hop
/// that dials the remote targets
fn interface_for(plan: &TopologyPlan, hop: &Hop, dials_remote: bool) -> Option<String> {
    hop.interface.clone().or_else(|| {
        dials_remote
            .then(|| plan.forward.interface_name.clone())
            .flatten()
            .filter(|i| !i.is_empty())
    })
}

fn plain_forward(plan: &TopologyPlan, hop: &Hop, port: u16, next: &[String], dials_remote: bool) -> ServiceConfig {
    let mut metadata = managed_metadata();
    if let Some(iface) = interface_for(plan, hop, dials_remote) {
        metadata.insert("interface".to_string(), Value::from(iface));
    }
    ServiceConfig {
        name: plan.service_name(hop),
        addr: join_host_port(hop.listen_host(), port),
        listener: ListenerConfig::new(FORWARD_TYPE),
        handler: HandlerConfig::new(FORWARD_TYPE),
        forwarder: Some(forwarder(next, plan.forward.strategy.as_deref())),
        metadata,
        chain: None,
        observer: None,
        limiter: None,
    }
}

/// Observer, stats and limiter attachments of the entry service
fn decorate_entry(plan: &TopologyPlan, service: &mut ServiceConfig, settings: &TopologySettings) {
    let entry = plan.entry();
    let panel = settings.panel_addr.as_deref().filter(|a| !a.is_empty());
    if let (Some(panel), false) = (panel, entry.node.secret.is_empty()) {
        service.observer = Some(ObserverConfig {
            name: format!("observer_{}", service.name),
            plugin: PluginConfig {
                kind: "http".to_string(),
                addr: format!(
                    "{}/flow/upload?secret={}",
                    panel.trim_end_matches('/'),
                    entry.node.secret
                ),
                token: settings.observer_token.clone(),
            },
        });
        service.metadata.insert("enableStats".to_string(), Value::Bool(true));
        service
            .metadata
            .insert("observer.period".to_string(), Value::from(OBSERVER_PERIOD));
    }

    if let Some(limit_id) = plan.forward.speed_limit_id {
        service.limiter = Some(limiter_name(limit_id));
    }
}

pub fn limiter_name(speed_limit_id: i64) -> String {
    format!("limiter_{}", speed_limit_id)
}

/// Build every hop's service for the plan, entry first
pub fn build_services(
    plan: &TopologyPlan,
    ports: &HopPorts,
    settings: &TopologySettings,
) -> Result<Vec<HopService>> {
    let mut built = Vec::with_capacity(plan.hops.len());

    // Dial address of each hop, for its predecessor
    let mut dial = Vec::with_capacity(plan.hops.len());
    for hop in &plan.hops {
        dial.push(join_host_port(hop.dial_host(), port_for(ports, hop)?));
    }

    if plan.is_relay() {
        let auth = relay_credentials(&plan.forward, settings.credential_key.as_deref())?;

        for (i, hop) in plan.hops.iter().enumerate() {
            let port = port_for(ports, hop)?;
            let service = match hop.role {
                HopRole::Entry => {
                    let chain_name = plan.chain_name();
                    let mut handler = HandlerConfig::new(FORWARD_TYPE);
                    handler.chain = Some(chain_name.clone());
                    let mut service = ServiceConfig {
                        name: plan.service_name(hop),
                        addr: join_host_port(hop.listen_host(), port),
                        listener: ListenerConfig::new(FORWARD_TYPE),
                        handler,
                        forwarder: Some(forwarder(&plan.targets, plan.forward.strategy.as_deref())),
                        metadata: managed_metadata(),
                        chain: Some(ChainConfig {
                            name: chain_name,
                            hops: vec![ChainHop {
                                name: "hop-0".to_string(),
                                nodes: vec![ChainNode {
                                    name: "node-0".to_string(),
                                    addr: dial[1].clone(),
                                    connector: ConnectorConfig {
                                        kind: RELAY_TYPE.to_string(),
                                        auth: Some(auth.clone()),
                                    },
                                    dialer: DialerConfig {
                                        kind: plan.tunnel.protocol.clone(),
                                    },
                                    interface: interface_for(plan, hop, false),
                                }],
                            }],
                        }),
                        observer: None,
                        limiter: None,
                    };
                    decorate_entry(plan, &mut service, settings);
                    service
                }
                HopRole::Mid { .. } => {
                    plain_forward(plan, hop, port, std::slice::from_ref(&dial[i + 1]), false)
                }
                HopRole::Exit => {
                    let mut handler = HandlerConfig::new(RELAY_TYPE);
                    handler.auth = Some(auth.clone());
                    let mut metadata = managed_metadata();
                    if let Some(iface) = interface_for(plan, hop, true) {
                        metadata.insert("interface".to_string(), Value::from(iface));
                    }
                    ServiceConfig {
                        name: plan.service_name(hop),
                        addr: join_host_port(hop.listen_host(), port),
                        listener: ListenerConfig::new(plan.tunnel.protocol.clone()),
                        handler,
                        forwarder: Some(forwarder(&plan.targets, plan.forward.strategy.as_deref())),
                        metadata,
                        chain: None,
                        observer: None,
                        limiter: None,
                    }
                }
            };
            built.push(HopService {
                index: hop.index,
                node_id: hop.node.id,
                role: hop.role,
                service,
            });
        }
    } else {
        let last = plan.hops.len() - 1;
        for (i, hop) in plan.hops.iter().enumerate() {
            let port = port_for(ports, hop)?;
            let dials_remote = i == last;
            let next: &[String] = if dials_remote {
                &plan.targets
            } else {
                std::slice::from_ref(&dial[i + 1])
            };
            let mut service = plain_forward(plan, hop, port, next, dials_remote);
            if hop.role == HopRole::Entry {
                decorate_entry(plan, &mut service, settings);
            }
            built.push(HopService {
                index: hop.index,
                node_id: hop.node.id,
                role: hop.role,
                service,
            });
        }
    }

    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::fixtures::*;
    use crate::plan::TunnelLayout;
    use hopwire_core::TunnelType;

    fn plan(kind: TunnelType, path: Vec<NodeId>, out: Option<NodeId>) -> TopologyPlan {
        let layout = TunnelLayout { path, ..Default::default() };
        TopologyPlan::new(forward(), tunnel(kind, out), &layout, lookup).unwrap()
    }

    #[test]
    fn test_direct_forward() {
        let p = plan(TunnelType::PortForward, vec![], None);
        let built = build_services(&p, &HopPorts { entry: 20000, ..Default::default() }, &TopologySettings::default()).unwrap();

        assert_eq!(built.len(), 1);
        let svc = &built[0].service;
        assert_eq!(svc.name, "11_2_0");
        assert_eq!(svc.addr, ":20000");
        let fwd = svc.forwarder.as_ref().unwrap();
        assert_eq!(fwd.nodes.len(), 1);
        assert_eq!(fwd.nodes[0].addr, "203.0.113.5:443");
        assert!(fwd.selector.is_none());
        assert!(svc.is_managed());
        assert!(svc.observer.is_none());
    }

    #[test]
    fn test_entry_listens_on_tunnel_in_ip() {
        let mut t = tunnel(TunnelType::PortForward, None);
        t.in_ip = "2001:db8::7".into();
        let p = TopologyPlan::new(forward(), t, &TunnelLayout::default(), lookup).unwrap();
        let built = build_services(&p, &HopPorts { entry: 20000, ..Default::default() }, &TopologySettings::default()).unwrap();

        assert_eq!(built[0].service.addr, "[2001:db8::7]:20000");
        assert_eq!(built[0].service.forwarder.as_ref().unwrap().nodes[0].addr, "203.0.113.5:443");
    }

    #[tokio::test]
    async fn test_explicit_empty_path_matches_absent_path() {
        use crate::plan::path_key;
        use hopwire_store::{MemoryStore, Store};

        let store = MemoryStore::new();
        store.save_node(node(1, "198.51.100.1")).await.unwrap();
        store.save_tunnel(tunnel(TunnelType::PortForward, None)).await.unwrap();

        let settings = TopologySettings {
            panel_addr: Some("https://panel.example.com".into()),
            ..Default::default()
        };
        let ports = HopPorts { entry: 20000, ..Default::default() };

        let absent = TopologyPlan::load(&store, forward()).await.unwrap();
        store.set_config(&path_key(1), "[]".into()).await.unwrap();
        let explicit = TopologyPlan::load(&store, forward()).await.unwrap();

        let a = build_services(&absent, &ports, &settings).unwrap();
        let b = build_services(&explicit, &ports, &settings).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a, b);
        assert_eq!(a[0].service.content_hash(), b[0].service.content_hash());
    }

    #[test]
    fn test_one_mid_hop_chain() {
        let p = plan(TunnelType::PortForward, vec![2], None);
        let ports = HopPorts { entry: 20000, mids: vec![31000], exit: None };
        let built = build_services(&p, &ports, &TopologySettings::default()).unwrap();

        assert_eq!(built.len(), 2);
        let entry = &built[0].service;
        assert_eq!(entry.forwarder.as_ref().unwrap().nodes[0].addr, "198.51.100.2:31000");

        let mid = &built[1].service;
        assert_eq!(built[1].node_id, 2);
        assert_eq!(mid.name, "11_2_0_mid_0");
        assert_eq!(mid.addr, ":31000");
        assert_eq!(mid.forwarder.as_ref().unwrap().nodes[0].addr, "203.0.113.5:443");
    }

    #[test]
    fn test_missing_mid_port_is_error() {
        let p = plan(TunnelType::PortForward, vec![2], None);
        let err = build_services(&p, &HopPorts { entry: 20000, ..Default::default() }, &TopologySettings::default())
            .unwrap_err();
        assert!(matches!(err, TopologyError::InvalidTopology(_)));
    }

    #[test]
    fn test_relay_direct_to_exit() {
        let p = plan(TunnelType::Relay, vec![], Some(3));
        let ports = HopPorts { entry: 20000, mids: vec![], exit: Some(30000) };
        let settings = TopologySettings { credential_key: Some("k".into()), ..Default::default() };
        let built = build_services(&p, &ports, &settings).unwrap();
        assert_eq!(built.len(), 2);

        let exit = &built[1].service;
        assert_eq!(built[1].node_id, 3);
        assert_eq!(exit.addr, ":30000");
        assert_eq!(exit.listener.kind, "tls");
        assert_eq!(exit.handler.kind, "relay");
        let auth = exit.handler.auth.as_ref().unwrap();
        assert_eq!(auth.username, "u11");
        assert_eq!(auth.password.len(), 16);

        let entry = &built[0].service;
        let chain = entry.chain.as_ref().unwrap();
        assert_eq!(entry.handler.chain.as_deref(), Some(chain.name.as_str()));
        let dial = &chain.hops[0].nodes[0];
        assert_eq!(dial.addr, "198.51.100.3:30000");
        assert_eq!(dial.connector.auth.as_ref(), Some(auth));
        assert_eq!(dial.dialer.kind, "tls");
    }

    #[test]
    fn test_relay_with_mid_hops() {
        let p = plan(TunnelType::Relay, vec![2], Some(3));
        let ports = HopPorts { entry: 20000, mids: vec![31000], exit: Some(30000) };
        let built = build_services(&p, &ports, &TopologySettings::default()).unwrap();
        assert_eq!(built.len(), 3);

        let chain = built[0].service.chain.as_ref().unwrap();
        assert_eq!(chain.hops[0].nodes[0].addr, "198.51.100.2:31000");
        assert_eq!(
            built[1].service.forwarder.as_ref().unwrap().nodes[0].addr,
            "198.51.100.3:30000"
        );
    }

    #[test]
    fn test_credentials_unique_per_forward() {
        let a = forward();
        let mut b = forward();
        b.id = 12;
        let ca = relay_credentials(&a, Some("key")).unwrap();
        let cb = relay_credentials(&b, Some("key")).unwrap();
        assert_ne!(ca.password, cb.password);
        assert_eq!(ca, relay_credentials(&a, Some("key")).unwrap());
        assert_ne!(ca.password, relay_credentials(&a, Some("other")).unwrap().password);
    }

    #[test]
    fn test_entry_observer_and_limiter() {
        let mut p = plan(TunnelType::PortForward, vec![], None);
        p.forward.speed_limit_id = Some(4);
        let settings = TopologySettings {
            panel_addr: Some("https://panel.example.com/".into()),
            observer_token: Some("tok".into()),
            ..Default::default()
        };
        let built = build_services(&p, &HopPorts { entry: 20000, ..Default::default() }, &settings).unwrap();
        let svc = &built[0].service;

        let observer = svc.observer.as_ref().unwrap();
        assert_eq!(
            observer.plugin.addr,
            "https://panel.example.com/flow/upload?secret=secret-1"
        );
        assert_eq!(observer.plugin.token.as_deref(), Some("tok"));
        assert_eq!(svc.metadata["enableStats"], Value::Bool(true));
        assert_eq!(svc.limiter.as_deref(), Some("limiter_4"));
    }

    #[test]
    fn test_no_observer_without_node_secret() {
        let mut p = plan(TunnelType::PortForward, vec![], None);
        p.hops[0].node.secret.clear();
        let settings = TopologySettings {
            panel_addr: Some("https://panel.example.com".into()),
            ..Default::default()
        };
        let built = build_services(&p, &HopPorts { entry: 20000, ..Default::default() }, &settings).unwrap();
        assert!(built[0].service.observer.is_none());
        assert!(!built[0].service.metadata.contains_key("enableStats"));
    }

    #[test]
    fn test_multiple_targets_get_selector() {
        let mut p = plan(TunnelType::PortForward, vec![], None);
        p.targets = vec!["203.0.113.5:443".into(), "203.0.113.6:443".into()];
        p.forward.strategy = Some("round".into());
        p.forward.interface_name = Some("wg0".into());
        let built = build_services(&p, &HopPorts { entry: 20000, ..Default::default() }, &TopologySettings::default()).unwrap();

        let fwd = built[0].service.forwarder.as_ref().unwrap();
        assert_eq!(fwd.nodes[1].name, "target-1");
        assert_eq!(fwd.selector.as_ref().unwrap().strategy, "round");
        assert_eq!(built[0].service.metadata["interface"], "wg0");
    }

    #[test]
    fn test_build_is_deterministic() {
        let p = plan(TunnelType::Relay, vec![2], Some(3));
        let ports = HopPorts { entry: 20000, mids: vec![31000], exit: Some(30000) };
        let settings = TopologySettings { credential_key: Some("k".into()), ..Default::default() };
        assert_eq!(
            build_services(&p, &ports, &settings).unwrap(),
            build_services(&p, &ports, &settings).unwrap()
        );
    }
}
