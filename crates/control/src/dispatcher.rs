//! Command dispatch
//!
//! Encodes a typed command into its envelope and writes it to a node's
//! connections according to the command's routing policy.

use std::sync::Arc;
use std::time::Duration;

use hopwire_core::NodeId;
use hopwire_protocol::{summarize, Command, Reply, Routing};
use tracing::debug;

use crate::{new_request_id, ConnectionRegistry, Correlation, Result};

/// Logged payload prefix length
const SUMMARY_BYTES: usize = 256;

pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    correlation: Arc<Correlation>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, correlation: Arc<Correlation>) -> Self {
        Self {
            registry,
            correlation,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Fire-and-forget send; returns how many connections accepted the frame
    pub async fn send(&self, node_id: NodeId, command: &Command) -> Result<usize> {
        let request_id = new_request_id();
        self.dispatch(node_id, command, &request_id).await
    }

    /// Send and wait for the correlated `<Command>Result` reply
    pub async fn call(&self, node_id: NodeId, command: &Command, timeout: Duration) -> Result<Reply> {
        let request_id = new_request_id();
        let table = self.correlation.table(command.reply_class());
        let rx = table.register(&request_id);

        if let Err(e) = self.dispatch(node_id, command, &request_id).await {
            table.cancel(&request_id);
            return Err(e);
        }

        table
            .wait(node_id, command.kind(), &request_id, rx, timeout)
            .await
    }

    async fn dispatch(&self, node_id: NodeId, command: &Command, request_id: &str) -> Result<usize> {
        let text = command.encode(request_id)?;
        debug!(
            node_id,
            command = command.kind(),
            request_id,
            connections = self.registry.count(node_id),
            "Dispatching {}",
            summarize(&text, SUMMARY_BYTES)
        );

        match command.routing() {
            Routing::Broadcast => self.registry.send(node_id, &text).await,
            Routing::Exclusive => self.registry.send_exclusive(node_id, &text).await.map(|_| 1),
        }
    }
}
