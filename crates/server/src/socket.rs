//! WebSocket edge
//!
//! `GET /system-info?secret=..&type=..&version=..&role=..` serves both node
//! agents and dashboard observers. Each accepted socket gets one reader task;
//! writes go through the connection's own writer.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hopwire_control::{Connection, ControlError, FrameSink, Handshake};
use hopwire_core::Node;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::AppState;

/// Connection type of a dashboard socket
pub const OBSERVER_TYPE: &str = "observer";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SocketQuery {
    #[serde(default)]
    pub secret: String,
    /// `node` (default) or `observer`
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl SocketQuery {
    pub fn is_observer(&self) -> bool {
        self.kind.as_deref() == Some(OBSERVER_TYPE)
    }

    pub fn handshake(&self) -> Handshake {
        Handshake {
            secret: self.secret.clone(),
            version: self.version.clone().filter(|v| !v.is_empty()),
            role: self.role.clone().filter(|r| !r.is_empty()),
        }
    }
}

/// Write half of an accepted socket
pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> hopwire_control::Result<()> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ControlError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

pub async fn system_info(
    State(state): State<AppState>,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if query.is_observer() {
            handle_observer(state, socket, query).await
        } else {
            handle_node(state, socket, query.handshake()).await
        }
    })
}

async fn handle_node(state: AppState, mut socket: WebSocket, handshake: Handshake) {
    let control = &state.control;
    let node = match control.reconnect.authenticate(&handshake).await {
        Ok(node) => node,
        Err(e) => {
            warn!("Rejected node socket: {}", e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (sink, stream) = socket.split();
    let conn = Connection::new(WsSink(sink), handshake.tag(), control.config.write_timeout);
    let conn_id = conn.id();

    if let Err(e) = control
        .reconnect
        .on_connect(&node, conn.clone(), handshake.version.clone())
        .await
    {
        error!(node_id = node.id, "Node connect bookkeeping failed: {}", e);
    }

    read_node_frames(&state, &node, stream).await;

    debug!(node_id = node.id, conn_id, "Node socket closed");
    if let Err(e) = control.reconnect.on_disconnect(node.id, conn_id).await {
        error!(node_id = node.id, "Node disconnect bookkeeping failed: {}", e);
    }
}

async fn read_node_frames(state: &AppState, node: &Node, mut stream: SplitStream<WebSocket>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.control.inbound.handle_frame(node.id, text.as_str()).await;
            }
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => state.control.inbound.handle_frame(node.id, text).await,
                Err(_) => debug!(node_id = node.id, "Dropped non-UTF-8 binary frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(node_id = node.id, "Node socket read error: {}", e);
                break;
            }
        }
    }
}

async fn handle_observer(state: AppState, mut socket: WebSocket, query: SocketQuery) {
    if let Some(ref token) = state.config.admin_token {
        if query.secret != *token {
            warn!("Rejected observer socket: bad token");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    let (sink, mut stream) = socket.split();
    let conn = Connection::new(WsSink(sink), OBSERVER_TYPE, state.control.config.write_timeout);
    let conn_id = conn.id();
    state.control.observers.add(conn);
    info!(conn_id, "Observer connected ({} total)", state.control.observers.count());

    // Observers only listen; drain until they go away
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.control.observers.remove(conn_id);
    debug!(conn_id, "Observer disconnected");
}
