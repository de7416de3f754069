//! Request id to waiter correlation
//!
//! A waiter is registered before the command is written and removed on the
//! first reply or on timeout, whichever comes first. Late or repeated
//! replies find no waiter and are dropped.

use std::collections::HashMap;
use std::time::Duration;

use hopwire_core::NodeId;
use hopwire_protocol::{Reply, ReplyClass};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{ControlError, Result};

pub struct CorrelationTable {
    name: &'static str,
    waiters: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl CorrelationTable {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter for `request_id`, replacing any stale one
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id.to_string(), tx);
        rx
    }

    /// Hand a reply to its waiter; returns false when nobody is waiting
    pub fn deliver(&self, reply: Reply) -> bool {
        let waiter = self.waiters.lock().remove(&reply.request_id);
        match waiter {
            Some(tx) => {
                let request_id = reply.request_id.clone();
                let delivered = tx.send(reply).is_ok();
                if !delivered {
                    debug!(table = self.name, request_id = %request_id, "Waiter gone before delivery");
                }
                delivered
            }
            None => {
                debug!(
                    table = self.name,
                    request_id = %reply.request_id,
                    "Dropping reply with no waiter"
                );
                false
            }
        }
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.waiters.lock().remove(request_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Wait for the reply to `request_id`, abandoning the waiter on timeout
    pub async fn wait(
        &self,
        node_id: NodeId,
        command: &str,
        request_id: &str,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Result<Reply> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.cancel(request_id);
                Err(ControlError::InvalidReply(format!(
                    "waiter for {} dropped",
                    request_id
                )))
            }
            Err(_) => {
                self.cancel(request_id);
                Err(ControlError::Timeout {
                    node_id,
                    command: command.to_string(),
                })
            }
        }
    }
}

/// Operation and diagnostic tables, kept apart so diagnostic floods
/// cannot starve operational calls
pub struct Correlation {
    operation: CorrelationTable,
    diagnostic: CorrelationTable,
}

impl Default for Correlation {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlation {
    pub fn new() -> Self {
        Self {
            operation: CorrelationTable::new("operation"),
            diagnostic: CorrelationTable::new("diagnostic"),
        }
    }

    pub fn table(&self, class: ReplyClass) -> &CorrelationTable {
        match class {
            ReplyClass::Operation => &self.operation,
            ReplyClass::Diagnostic => &self.diagnostic,
        }
    }

    /// Route a reply to the table its command class uses
    pub fn deliver(&self, reply: Reply) -> bool {
        self.table(reply.class()).deliver(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(command: &str, request_id: &str) -> Reply {
        Reply {
            command: command.into(),
            request_id: request_id.into(),
            data: json!({"success": true}),
        }
    }

    #[tokio::test]
    async fn test_single_delivery() {
        let table = CorrelationTable::new("test");
        let rx = table.register("r1");

        assert!(table.deliver(reply("WriteFile", "r1")));
        assert!(!table.deliver(reply("WriteFile", "r1")));

        let got = table
            .wait(1, "WriteFile", "r1", rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got.request_id, "r1");
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_waiter() {
        let table = CorrelationTable::new("test");
        let rx = table.register("r2");

        let err = table
            .wait(4, "ProbePort", "r2", rx, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Timeout { node_id: 4, .. }));
        assert_eq!(table.pending_count(), 0);

        // Late reply after abandonment is a no-op
        assert!(!table.deliver(reply("ProbePort", "r2")));
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_dropped() {
        let table = CorrelationTable::new("test");
        let _rx = table.register("known");
        assert!(!table.deliver(reply("AddService", "unknown")));
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_classes_use_separate_tables() {
        let correlation = Correlation::new();
        let _diag = correlation.table(ReplyClass::Diagnostic).register("same");
        let _op = correlation.table(ReplyClass::Operation).register("same");

        assert!(correlation.deliver(reply("Diagnose", "same")));
        assert_eq!(correlation.table(ReplyClass::Diagnostic).pending_count(), 0);
        assert_eq!(correlation.table(ReplyClass::Operation).pending_count(), 1);
    }
}
