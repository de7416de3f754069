//! Interactive session registry (shell, streamed scripts, log capture)

use std::collections::HashMap;

use hopwire_core::NodeId;
use hopwire_protocol::{StreamChunk, StreamKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffered output chunks per session before new output is dropped
const SESSION_BUFFER: usize = 256;

struct Session {
    node_id: NodeId,
    tx: mpsc::Sender<StreamChunk>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session; output chunks for `session_id` arrive on the receiver
    pub fn open(&self, node_id: NodeId, session_id: &str) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let previous = self
            .sessions
            .lock()
            .insert(session_id.to_string(), Session { node_id, tx });
        if previous.is_some() {
            debug!(node_id, session_id, "Replaced existing session");
        }
        rx
    }

    /// Route an output chunk to its session.
    ///
    /// `SessionClosed` is forwarded and then removes the session.
    pub fn route(&self, chunk: StreamChunk) -> bool {
        let closing = chunk.kind == StreamKind::SessionClosed;
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get(&chunk.session_id) else {
            debug!(session_id = %chunk.session_id, "Output for unknown session dropped");
            return false;
        };

        let session_id = chunk.session_id.clone();
        let delivered = match session.tx.try_send(chunk) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %session_id, "Session buffer full, dropping output");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                sessions.remove(&session_id);
                return false;
            }
        };

        if closing {
            sessions.remove(&session_id);
        }
        delivered
    }

    /// Remove a session; returns the node it was running on
    pub fn close(&self, session_id: &str) -> Option<NodeId> {
        self.sessions.lock().remove(session_id).map(|s| s.node_id)
    }

    /// Drop every session of a node (its last connection went away)
    pub fn close_node(&self, node_id: NodeId) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        let ids: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            sessions.remove(id);
        }
        ids
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(kind: StreamKind, session_id: &str, data: &str) -> StreamChunk {
        StreamChunk {
            kind,
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    #[tokio::test]
    async fn test_output_routed_until_closed() {
        let sessions = SessionRegistry::new();
        let mut rx = sessions.open(3, "s1");

        assert!(sessions.route(chunk(StreamKind::ShellOutput, "s1", "$ ")));
        assert!(sessions.route(chunk(StreamKind::SessionClosed, "s1", "")));
        assert!(!sessions.route(chunk(StreamKind::ShellOutput, "s1", "late")));

        assert_eq!(rx.recv().await.unwrap().data, "$ ");
        assert_eq!(rx.recv().await.unwrap().kind, StreamKind::SessionClosed);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_removes_session() {
        let sessions = SessionRegistry::new();
        drop(sessions.open(3, "s2"));
        assert!(!sessions.route(chunk(StreamKind::LogOutput, "s2", "line")));
        assert_eq!(sessions.count(), 0);
    }

    #[test]
    fn test_close_node() {
        let sessions = SessionRegistry::new();
        let _a = sessions.open(1, "a");
        let _b = sessions.open(1, "b");
        let _c = sessions.open(2, "c");

        let mut closed = sessions.close_node(1);
        closed.sort();
        assert_eq!(closed, vec!["a", "b"]);
        assert_eq!(sessions.close("c"), Some(2));
        assert_eq!(sessions.count(), 0);
    }
}
