//! hopwire Server
//!
//! The panel's network edge.
//!
//! ## Routes
//!
//! - `GET /system-info` - WebSocket for node agents and dashboard observers
//! - `POST /api/{method}` - JSON methods handled by [`ControlApi`]
//! - `GET /health` - liveness
//!
//! ## Background tasks
//!
//! - offline sweep: nodes persisted online without a live socket go offline
//! - store flush: the JSON state file is rewritten when dirty

mod api;
mod config;
mod socket;
mod tasks;

pub use api::ControlApi;
pub use config::PanelConfig;
pub use socket::{SocketQuery, WsSink, OBSERVER_TYPE};
pub use tasks::{offline_sweep, store_flush, PeriodicTask};

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use hopwire_control::{AlertSink, ControlPlane, LogAlertSink};
use hopwire_store::{MemoryStore, StoreError};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PanelConfig>,
    pub control: ControlPlane,
    pub api: Arc<ControlApi>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/system-info", get(socket::system_info))
        .route("/api/{method}", post(api_call))
        .route("/health", get(health))
        .with_state(state)
}

async fn api_call(
    State(state): State<AppState>,
    Path(method): Path<String>,
    body: Bytes,
) -> Json<Value> {
    let params = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                return Json(json!({"success": false, "message": format!("Invalid JSON: {}", e)}))
            }
        }
    };

    match state.api.handle(&method, params).await {
        Ok(reply) => Json(reply),
        Err(message) => Json(json!({"success": false, "message": message})),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "nodes": state.control.registry.connected_nodes().len(),
        "observers": state.control.observers.count(),
    }))
}

/// A fully wired panel: store, control plane, API and background tasks
pub struct Panel {
    config: Arc<PanelConfig>,
    store: Arc<MemoryStore>,
    control: ControlPlane,
    api: Arc<ControlApi>,
}

impl Panel {
    /// Open the state file named in the config (if any) and wire everything up
    pub fn new(config: PanelConfig) -> Result<Self> {
        let store = match config.data_path {
            Some(ref path) => MemoryStore::open(path)?,
            None => MemoryStore::new(),
        };
        Ok(Self::with_store(config, Arc::new(store), Arc::new(LogAlertSink)))
    }

    pub fn with_store(
        config: PanelConfig,
        store: Arc<MemoryStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let control = ControlPlane::with_alerts(store.clone(), config.control_config(), alerts);
        let api = Arc::new(ControlApi::new(control.clone(), config.topology_settings()));
        Self {
            config: Arc::new(config),
            store,
            control,
            api,
        }
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn api(&self) -> &ControlApi {
        &self.api
    }

    pub fn state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            control: self.control.clone(),
            api: self.api.clone(),
        }
    }

    /// Serve until ctrl-c, then stop the tasks and flush once more
    pub async fn serve(self) -> Result<()> {
        let addr = self.config.listen_addr.clone();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("Panel listening on {}", addr);

        let sweep = offline_sweep(self.control.reconnect.clone(), self.config.offline_sweep_interval());
        let flush = store_flush(self.store.clone(), self.config.flush_interval());

        let served = axum::serve(listener, router(self.state()))
            .with_graceful_shutdown(shutdown_signal())
            .await;

        sweep.stop().await;
        flush.stop().await;
        if let Err(e) = self.store.flush() {
            warn!("Final state flush failed: {}", e);
        }

        served?;
        info!("Panel stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
