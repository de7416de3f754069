//! JSON method dispatcher behind `POST /api/{method}`
//!
//! Every reply has the shape `{"success": bool, "message": str, "data": ..}`.
//! Operations that touch several hops report per-hop results in `data` and
//! fail only when a hop failed.

use std::collections::BTreeMap;
use std::time::Duration;

use hopwire_control::ControlPlane;
use hopwire_core::{NewForward, Node, NodeId, Tunnel, TunnelId, TunnelType};
use hopwire_protocol::DiagnoseKind;
use hopwire_topology::{ForwardService, ForwardUpdate, HopResult, TopologySettings};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 60;

#[derive(Deserialize)]
struct IdParams {
    id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeView {
    #[serde(flatten)]
    node: Node,
    connections: usize,
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    params
        .ok_or_else(|| "Missing params".to_string())
        .and_then(|p| serde_json::from_value(p).map_err(|e| format!("Invalid params: {}", e)))
}

/// Like [`parse`], but absent params mean the defaults
fn parse_optional<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T, String> {
    match params {
        Some(Value::Null) | None => Ok(T::default()),
        Some(p) => parse(Some(p)),
    }
}

fn data<T: Serialize>(value: T) -> Result<Value, String> {
    let value = serde_json::to_value(value).map_err(|e| format!("Serialize error: {}", e))?;
    Ok(json!({"success": true, "message": "", "data": value}))
}

/// Success only when every hop succeeded; failing hops are named in `message`
fn hop_reply<T: Serialize>(hops: &[HopResult], value: T) -> Result<Value, String> {
    let failed: Vec<String> = hops
        .iter()
        .filter(|h| !h.success)
        .map(|h| format!("hop {} (node {}): {}", h.index, h.node_id, h.message))
        .collect();
    let value = serde_json::to_value(value).map_err(|e| format!("Serialize error: {}", e))?;
    Ok(json!({
        "success": failed.is_empty(),
        "message": failed.join("; "),
        "data": value,
    }))
}

pub struct ControlApi {
    control: ControlPlane,
    forwards: ForwardService,
}

impl ControlApi {
    pub fn new(control: ControlPlane, settings: TopologySettings) -> Self {
        let forwards = ForwardService::new(control.clone(), settings);
        Self { control, forwards }
    }

    pub fn forwards(&self) -> &ForwardService {
        &self.forwards
    }

    pub async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, String> {
        debug!("Handling method: {}", method);

        let store = &self.control.store;
        let rpc = &self.control.rpc;

        match method {
            // ── Nodes ─────────────────────────────────────────
            "node_list" => {
                let nodes = store
                    .nodes()
                    .await
                    .map_err(|e| format!("Store error: {}", e))?;
                let views: Vec<NodeView> = nodes
                    .into_iter()
                    .map(|node| NodeView {
                        connections: self.control.registry.count(node.id),
                        node,
                    })
                    .collect();
                data(views)
            }

            "node_save" => {
                let node: Node = parse(params)?;
                if node.secret.is_empty() {
                    return Err("Missing node secret".to_string());
                }
                let saved = store
                    .save_node(node)
                    .await
                    .map_err(|e| format!("Store error: {}", e))?;
                data(saved)
            }

            "node_disconnects" => {
                let params: IdParams = parse(params)?;
                let records = store
                    .disconnects(params.id)
                    .await
                    .map_err(|e| format!("Store error: {}", e))?;
                data(records)
            }

            "node_logs" => {
                let params: IdParams = parse(params)?;
                let logs = store
                    .operation_logs(params.id)
                    .await
                    .map_err(|e| format!("Store error: {}", e))?;
                data(logs)
            }

            "node_system_info" => {
                let params: IdParams = parse(params)?;
                let info = store
                    .system_info(params.id)
                    .await
                    .map_err(|e| format!("Store error: {}", e))?;
                data(info)
            }

            "node_services" => {
                #[derive(Deserialize)]
                struct ServicesParams {
                    id: NodeId,
                    #[serde(default)]
                    filter: Option<String>,
                }

                let params: ServicesParams = parse(params)?;
                let services = rpc
                    .query_services(params.id, params.filter)
                    .await
                    .map_err(|e| format!("Query error: {}", e))?;
                data(services)
            }

            "node_diagnose" => {
                #[derive(Deserialize)]
                struct DiagnoseParams {
                    id: NodeId,
                    target: String,
                    #[serde(default)]
                    kind: DiagnoseKind,
                }

                let params: DiagnoseParams = parse(params)?;
                let report = rpc
                    .diagnose(params.id, &params.target, params.kind)
                    .await
                    .map_err(|e| format!("Diagnose error: {}", e))?;
                data(report)
            }

            "node_run_script" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct ScriptParams {
                    id: NodeId,
                    script: String,
                    #[serde(default)]
                    timeout_secs: Option<u64>,
                }

                let params: ScriptParams = parse(params)?;
                let timeout = params.timeout_secs.unwrap_or(DEFAULT_SCRIPT_TIMEOUT_SECS);
                let output = rpc
                    .run_script(params.id, &params.script, Duration::from_secs(timeout))
                    .await
                    .map_err(|e| format!("Script error: {}", e))?;
                data(output)
            }

            "node_restart_service" => {
                #[derive(Deserialize)]
                struct UnitParams {
                    id: NodeId,
                    unit: String,
                }

                let params: UnitParams = parse(params)?;
                let outcome = rpc
                    .restart_service(params.id, &params.unit)
                    .await
                    .map_err(|e| format!("Restart error: {}", e))?;
                Ok(json!({"success": outcome.success, "message": outcome.message}))
            }

            "node_upgrade" => {
                let params: IdParams = parse(params)?;
                let config = &self.control.config;
                let version = config
                    .expected_agent_version
                    .as_deref()
                    .ok_or_else(|| "No agent version configured".to_string())?;
                let url = config.agent_download_url.as_deref().unwrap_or_default();
                let sent = rpc
                    .upgrade(params.id, version, url)
                    .await
                    .map_err(|e| format!("Upgrade error: {}", e))?;
                data(json!({"connections": sent}))
            }

            "node_uninstall" => {
                let params: IdParams = parse(params)?;
                let sent = rpc
                    .uninstall(params.id)
                    .await
                    .map_err(|e| format!("Uninstall error: {}", e))?;
                data(json!({"connections": sent}))
            }

            // ── Tunnels ───────────────────────────────────────
            "tunnel_list" => {
                let tunnels = store
                    .tunnels()
                    .await
                    .map_err(|e| format!("Store error: {}", e))?;
                data(tunnels)
            }

            "tunnel_save" => {
                let tunnel: Tunnel = parse(params)?;
                if tunnel.tunnel_type == TunnelType::Relay && tunnel.out_node_id.is_none() {
                    return Err("Relay tunnel needs an exit node".to_string());
                }
                let saved = store
                    .save_tunnel(tunnel)
                    .await
                    .map_err(|e| format!("Store error: {}", e))?;
                data(saved)
            }

            "tunnel_layout" => {
                let params: IdParams = parse(params)?;
                let layout = self
                    .forwards
                    .layout(params.id)
                    .await
                    .map_err(|e| format!("Tunnel error: {}", e))?;
                data(json!({
                    "path": layout.path,
                    "bind": layout.bind,
                    "iface": layout.iface,
                }))
            }

            "tunnel_path_set" => {
                #[derive(Deserialize)]
                struct PathParams {
                    id: TunnelId,
                    #[serde(default)]
                    path: Vec<NodeId>,
                }

                let params: PathParams = parse(params)?;
                self.forwards
                    .set_path(params.id, params.path)
                    .await
                    .map_err(|e| format!("Tunnel error: {}", e))?;
                Ok(json!({"success": true, "message": ""}))
            }

            "tunnel_bind_set" | "tunnel_iface_set" => {
                #[derive(Deserialize)]
                struct MapParams {
                    id: TunnelId,
                    #[serde(default)]
                    map: BTreeMap<NodeId, String>,
                }

                let params: MapParams = parse(params)?;
                let result = if method == "tunnel_bind_set" {
                    self.forwards.set_bind_map(params.id, params.map).await
                } else {
                    self.forwards.set_iface_map(params.id, params.map).await
                };
                result.map_err(|e| format!("Tunnel error: {}", e))?;
                Ok(json!({"success": true, "message": ""}))
            }

            // ── Forwards ──────────────────────────────────────
            "forward_list" => {
                #[derive(Deserialize, Default)]
                #[serde(rename_all = "camelCase")]
                struct ListParams {
                    #[serde(default)]
                    tunnel_id: Option<TunnelId>,
                }

                let params: ListParams = parse_optional(params)?;
                let forwards = match params.tunnel_id {
                    Some(tunnel_id) => store.forwards_by_tunnel(tunnel_id).await,
                    None => store.forwards().await,
                }
                .map_err(|e| format!("Store error: {}", e))?;
                data(forwards)
            }

            "forward_get" => {
                let params: IdParams = parse(params)?;
                let forward = self
                    .forwards
                    .forward(params.id)
                    .await
                    .map_err(|e| format!("Forward error: {}", e))?;
                data(forward)
            }

            "forward_create" => {
                let request: NewForward = parse(params)?;
                let outcome = self
                    .forwards
                    .create(request)
                    .await
                    .map_err(|e| format!("Forward error: {}", e))?;
                hop_reply(&outcome.hops, &outcome)
            }

            "forward_update" => {
                #[derive(Deserialize)]
                struct UpdateParams {
                    id: i64,
                    #[serde(flatten)]
                    changes: ForwardUpdate,
                }

                let params: UpdateParams = parse(params)?;
                let outcome = self
                    .forwards
                    .update(params.id, params.changes)
                    .await
                    .map_err(|e| format!("Forward error: {}", e))?;
                hop_reply(&outcome.hops, &outcome)
            }

            "forward_redeploy" => {
                let params: IdParams = parse(params)?;
                let outcome = self
                    .forwards
                    .redeploy(params.id)
                    .await
                    .map_err(|e| format!("Forward error: {}", e))?;
                hop_reply(&outcome.hops, &outcome)
            }

            "forward_delete" | "forward_pause" | "forward_resume" => {
                let params: IdParams = parse(params)?;
                let hops = match method {
                    "forward_delete" => self.forwards.delete(params.id).await,
                    "forward_pause" => self.forwards.pause(params.id).await,
                    _ => self.forwards.resume(params.id).await,
                }
                .map_err(|e| format!("Forward error: {}", e))?;
                hop_reply(&hops, &hops)
            }

            "forward_status" => {
                let params: IdParams = parse(params)?;
                let health = self
                    .forwards
                    .status(params.id)
                    .await
                    .map_err(|e| format!("Status error: {}", e))?;
                data(health)
            }

            "forward_diagnose" => {
                let params: IdParams = parse(params)?;
                let results = self
                    .forwards
                    .diagnose(params.id)
                    .await
                    .map_err(|e| format!("Diagnose error: {}", e))?;
                data(results)
            }

            "forward_limiter_sync" => {
                #[derive(Deserialize)]
                struct LimiterParams {
                    id: i64,
                    limits: Vec<String>,
                }

                let params: LimiterParams = parse(params)?;
                let result = self
                    .forwards
                    .sync_limiter(params.id, params.limits)
                    .await
                    .map_err(|e| format!("Limiter error: {}", e))?;
                hop_reply(std::slice::from_ref(&result), &result)
            }

            _ => Err(format!("Unknown method: {}", method)),
        }
    }
}
