//! Inbound frame routing
//!
//! Runs on each node socket's reader task; never blocks on a network write
//! to the node itself.

use std::sync::Arc;

use hopwire_core::NodeId;
use hopwire_protocol::{classify, summarize, Inbound};
use hopwire_store::Store;
use serde_json::json;
use tracing::{debug, warn};

use crate::{Correlation, ObserverRegistry, SessionRegistry, SnapshotCache};

pub struct InboundRouter {
    correlation: Arc<Correlation>,
    sessions: Arc<SessionRegistry>,
    snapshots: Arc<SnapshotCache>,
    observers: Arc<ObserverRegistry>,
    store: Arc<dyn Store>,
}

impl InboundRouter {
    pub fn new(
        correlation: Arc<Correlation>,
        sessions: Arc<SessionRegistry>,
        snapshots: Arc<SnapshotCache>,
        observers: Arc<ObserverRegistry>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            correlation,
            sessions,
            snapshots,
            observers,
            store,
        }
    }

    /// Handle one text frame received from `node_id`
    pub async fn handle_frame(&self, node_id: NodeId, text: &str) {
        let inbound = match classify(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(node_id, "Dropping frame: {} ({})", e, summarize(text, 128));
                return;
            }
        };

        match inbound {
            Inbound::Reply(reply) => {
                debug!(
                    node_id,
                    command = %reply.command,
                    request_id = %reply.request_id,
                    "Reply received"
                );
                self.correlation.deliver(reply);
            }
            Inbound::Stream(chunk) => {
                self.sessions.route(chunk);
            }
            Inbound::ServiceReport(report) => {
                debug!(node_id, services = report.services.len(), "Service report");
                self.snapshots.update(node_id, &report);
            }
            Inbound::Telemetry(info) => {
                if let Err(e) = self.store.record_system_info(node_id, info.clone()).await {
                    warn!(node_id, "Failed to record system info: {}", e);
                }
                self.observers
                    .broadcast_json(&json!({"type": "info", "id": node_id, "data": info}))
                    .await;
            }
        }
    }
}
