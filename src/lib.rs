//! Shared fixtures for the workspace integration tests
//!
//! [`FakeAgent`] is an in-process node agent: it reads commands off a
//! channel-backed connection, keeps a service table and answers with
//! `<Command>Result` frames through the real inbound router.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hopwire_control::{
    AlertSink, ChannelSink, Connection, ConnectionId, ControlConfig, ControlPlane, NodeEvent,
    RpcTimeouts,
};
use hopwire_core::{port_of, LimiterConfig, Node, NodeId, NodeStatus, ServiceConfig, Tunnel};
use hopwire_protocol::{Command, RESULT_SUFFIX};
use hopwire_store::{MemoryStore, Store};
use hopwire_topology::{ForwardService, TopologySettings};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

pub const AGENT_VERSION: &str = "1.0.0";

/// What the fake agent runs and what it was asked to do
#[derive(Debug, Default)]
pub struct AgentState {
    pub services: BTreeMap<String, ServiceConfig>,
    pub paused: BTreeSet<String>,
    /// Ports held by something other than a declared service
    pub busy_ports: BTreeSet<u16>,
    /// Service names whose push is rejected
    pub reject: BTreeSet<String>,
    /// Answer `SuggestPorts`; rejected otherwise
    pub suggest: bool,
    /// Never reply to anything
    pub silent: bool,
    /// Refuse `AddService` for running names and `UpdateService` for unknown ones
    pub strict: bool,
    pub limiters: Vec<LimiterConfig>,
    pub received: Vec<Command>,
}

impl AgentState {
    /// Bound right now: held elsewhere, or a running (not paused) service
    fn port_in_use(&self, port: u16) -> bool {
        self.busy_ports.contains(&port)
            || self
                .services
                .values()
                .any(|s| s.port() == Some(port) && !self.paused.contains(&s.name))
    }

    fn status_of(&self, service: &ServiceConfig) -> Value {
        json!({
            "name": service.name,
            "addr": service.addr,
            "listening": !self.paused.contains(&service.name),
            "metadata": service.metadata,
            "hash": service.content_hash(),
        })
    }

    /// Reply payload, or `None` for commands that are not acknowledged
    fn answer(&mut self, command: &Command) -> Option<Value> {
        if self.silent {
            return None;
        }
        let ok = json!({"success": true, "message": ""});
        let reply = match command {
            Command::AddService(services) | Command::UpdateService(services) => {
                if let Some(bad) = services.iter().find(|s| self.reject.contains(&s.name)) {
                    return Some(json!({"success": false, "message": format!("{} rejected", bad.name)}));
                }
                if self.strict {
                    let update = matches!(command, Command::UpdateService(_));
                    let conflict = services
                        .iter()
                        .find(|s| self.services.contains_key(&s.name) != update);
                    if let Some(bad) = conflict {
                        let message = if update {
                            format!("service {} not found", bad.name)
                        } else {
                            format!("service {} already exists", bad.name)
                        };
                        return Some(json!({"success": false, "message": message}));
                    }
                }
                for service in services {
                    self.services.insert(service.name.clone(), service.clone());
                }
                ok
            }
            Command::DeleteService(names) => {
                for name in &names.services {
                    self.services.remove(name);
                    self.paused.remove(name);
                }
                ok
            }
            Command::PauseService(names) => {
                self.paused.extend(names.services.iter().cloned());
                ok
            }
            Command::ResumeService(names) => {
                for name in &names.services {
                    self.paused.remove(name);
                }
                ok
            }
            Command::QueryServices(query) => {
                let prefix = query.filter.clone().unwrap_or_default();
                let services: Vec<Value> = self
                    .services
                    .values()
                    .filter(|s| s.name.starts_with(&prefix))
                    .map(|s| self.status_of(s))
                    .collect();
                json!({"services": services})
            }
            Command::GetService(get) => {
                let service = self.services.get(&get.name).map(|s| self.status_of(s));
                json!({"service": service})
            }
            Command::ProbePort(probe) => {
                json!({"port": probe.port, "inUse": self.port_in_use(probe.port)})
            }
            Command::SuggestPorts(req) => {
                if !self.suggest {
                    return Some(json!({"success": false, "message": "unsupported"}));
                }
                let ports: Vec<u16> = (req.base.max(req.min)..=req.max)
                    .filter(|p| !self.port_in_use(*p))
                    .take(req.count as usize)
                    .collect();
                json!({"ports": ports})
            }
            Command::Diagnose(diag) => {
                json!({"reachable": port_of(&diag.target).is_some(), "averageMs": 1.5, "message": ""})
            }
            Command::UpsertLimiters(limiters) => {
                self.limiters.extend(limiters.iter().cloned());
                ok
            }
            Command::UpgradeAgent(_) | Command::UninstallAgent => return None,
            _ => ok,
        };
        Some(reply)
    }
}

/// In-process node agent
pub struct FakeAgent {
    pub node_id: NodeId,
    pub conn_id: ConnectionId,
    state: Arc<Mutex<AgentState>>,
    control: ControlPlane,
    task: JoinHandle<()>,
}

impl FakeAgent {
    /// Authenticate with the node's secret and start answering commands
    pub async fn connect(control: &ControlPlane, node: &Node) -> Self {
        Self::connect_with(control, node, AgentState::default()).await
    }

    pub async fn connect_with(control: &ControlPlane, node: &Node, initial: AgentState) -> Self {
        let (sink, mut rx) = ChannelSink::new();
        let conn = Connection::new(sink, "agent", Duration::from_secs(1));
        let conn_id = conn.id();
        let state = Arc::new(Mutex::new(initial));

        let node_id = node.id;
        let agent_state = state.clone();
        let inbound = control.inbound.clone();
        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let Ok((command, request_id)) = Command::decode(&text) else {
                    continue;
                };
                let reply = {
                    let mut state = agent_state.lock();
                    state.received.push(command.clone());
                    state.answer(&command)
                };
                if let Some(data) = reply {
                    let frame = json!({
                        "type": format!("{}{}", command.kind(), RESULT_SUFFIX),
                        "requestId": request_id,
                        "data": data,
                    });
                    inbound.handle_frame(node_id, &frame.to_string()).await;
                }
            }
        });

        control
            .reconnect
            .on_connect(node, conn, Some(AGENT_VERSION.to_string()))
            .await
            .expect("on_connect");

        Self {
            node_id,
            conn_id,
            state,
            control: control.clone(),
            task,
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut AgentState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn service(&self, name: &str) -> Option<ServiceConfig> {
        self.state.lock().services.get(name).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.state.lock().services.keys().cloned().collect()
    }

    /// Kinds of every command received, in order
    pub fn received_kinds(&self) -> Vec<&'static str> {
        self.state.lock().received.iter().map(Command::kind).collect()
    }

    /// Send a `ServiceReport` of everything currently running
    pub async fn report(&self) {
        let services: Vec<Value> = self
            .state
            .lock()
            .services
            .values()
            .map(|s| json!({"name": s.name, "hash": s.content_hash()}))
            .collect();
        let frame = json!({"type": "ServiceReport", "data": {"services": services}});
        self.control
            .inbound
            .handle_frame(self.node_id, &frame.to_string())
            .await;
    }

    /// Close the socket the way the edge does
    pub async fn disconnect(self) {
        self.task.abort();
        self.control
            .reconnect
            .on_disconnect(self.node_id, self.conn_id)
            .await
            .expect("on_disconnect");
    }
}

/// Alert sink that keeps every event
#[derive(Default)]
pub struct RecordingAlerts {
    events: Mutex<Vec<NodeEvent>>,
}

impl RecordingAlerts {
    pub fn events(&self) -> Vec<NodeEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn notify(&self, event: NodeEvent) {
        self.events.lock().push(event);
    }
}

/// Store, control plane and forward service wired for tests
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub control: ControlPlane,
    pub forwards: ForwardService,
    pub alerts: Arc<RecordingAlerts>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(TopologySettings::default())
    }

    pub fn with_settings(settings: TopologySettings) -> Self {
        Self::with_config(test_config(), settings)
    }

    pub fn with_config(config: ControlConfig, settings: TopologySettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(RecordingAlerts::default());
        let control = ControlPlane::with_alerts(store.clone(), config, alerts.clone());
        let forwards = ForwardService::new(control.clone(), settings);
        Self {
            store,
            control,
            forwards,
            alerts,
        }
    }

    /// Save node `id` reachable at `ip` with a public port range
    pub async fn add_node(&self, id: NodeId, ip: &str, range: (u16, u16)) -> Node {
        self.store
            .save_node(Node {
                id,
                name: format!("node-{}", id),
                secret: format!("secret-{}", id),
                server_ip: ip.to_string(),
                version: None,
                port_sta: range.0,
                port_end: range.1,
                status: NodeStatus::Offline,
            })
            .await
            .expect("save node")
    }

    pub async fn add_tunnel(&self, tunnel: Tunnel) -> Tunnel {
        self.store.save_tunnel(tunnel).await.expect("save tunnel")
    }

    pub async fn node(&self, id: NodeId) -> Node {
        self.store.node(id).await.expect("store").expect("node exists")
    }

    pub async fn connect(&self, id: NodeId) -> FakeAgent {
        let node = self.node(id).await;
        FakeAgent::connect(&self.control, &node).await
    }

    pub async fn connect_with(&self, id: NodeId, state: AgentState) -> FakeAgent {
        let node = self.node(id).await;
        FakeAgent::connect_with(&self.control, &node, state).await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Short deadlines so failing calls do not stall the suite
pub fn test_config() -> ControlConfig {
    ControlConfig {
        write_timeout: Duration::from_secs(1),
        timeouts: RpcTimeouts {
            operation: Duration::from_secs(2),
            diagnose: Duration::from_secs(2),
            probe: Duration::from_secs(1),
        },
        ..ControlConfig::default()
    }
}
