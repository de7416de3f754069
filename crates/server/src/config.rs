//! Panel configuration
//!
//! A single JSON file; every field has a default so a missing file or a
//! partial one both load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hopwire_control::{ControlConfig, RpcTimeouts};
use hopwire_topology::{TopologySettings, DEFAULT_PROBE_BUDGET};
use serde::{Deserialize, Serialize};

use crate::{Result, ServerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub listen_addr: String,
    /// Public base URL of this panel, used in observer plugins
    pub panel_addr: Option<String>,
    /// HMAC key for relay passwords
    pub credential_key: Option<String>,
    pub expected_agent_version: Option<String>,
    pub agent_download_url: Option<String>,
    pub primary_role: String,
    pub rpc_timeout_secs: u64,
    pub diagnose_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub snapshot_staleness_secs: u64,
    pub offline_sweep_secs: u64,
    pub flush_interval_secs: u64,
    /// JSON state file; state is kept in memory only when unset
    pub data_path: Option<PathBuf>,
    /// Token handed to observer plugins for traffic uploads
    pub observer_token: Option<String>,
    /// Secret dashboard sockets must present; any observer is accepted when unset
    pub admin_token: Option<String>,
    /// Ports probed per allocation when the agent offers no suggestions
    pub port_probe_budget: usize,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6365".to_string(),
            panel_addr: None,
            credential_key: None,
            expected_agent_version: None,
            agent_download_url: None,
            primary_role: "agent".to_string(),
            rpc_timeout_secs: 10,
            diagnose_timeout_secs: 30,
            probe_timeout_secs: 3,
            write_timeout_secs: 5,
            snapshot_staleness_secs: 15,
            offline_sweep_secs: 30,
            flush_interval_secs: 5,
            data_path: None,
            observer_token: None,
            admin_token: None,
            port_probe_budget: DEFAULT_PROBE_BUDGET,
        }
    }
}

impl PanelConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Default location of the config file
    ///
    /// - macOS: `~/Library/Application Support/hopwire/config.json`
    /// - Linux: `$XDG_CONFIG_HOME/hopwire/config.json` (or `~/.config/hopwire`)
    /// - Windows: `%APPDATA%\hopwire\config.json`
    pub fn default_path() -> PathBuf {
        default_config_dir().join("config.json")
    }

    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            primary_role: self.primary_role.clone(),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            timeouts: RpcTimeouts {
                operation: Duration::from_secs(self.rpc_timeout_secs),
                diagnose: Duration::from_secs(self.diagnose_timeout_secs),
                probe: Duration::from_secs(self.probe_timeout_secs),
            },
            expected_agent_version: self.expected_agent_version.clone(),
            agent_download_url: self.agent_download_url.clone(),
            snapshot_staleness: Duration::from_secs(self.snapshot_staleness_secs),
        }
    }

    pub fn topology_settings(&self) -> TopologySettings {
        TopologySettings {
            panel_addr: self.panel_addr.clone().filter(|a| !a.is_empty()),
            observer_token: self.observer_token.clone().filter(|t| !t.is_empty()),
            credential_key: self.credential_key.clone().filter(|k| !k.is_empty()),
            probe_budget: self.port_probe_budget.max(1),
        }
    }

    pub fn offline_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.offline_sweep_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

fn default_config_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home_dir()
            .map(|h| h.join("Library/Application Support/hopwire"))
            .unwrap_or_else(|| PathBuf::from(".hopwire"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("hopwire"))
            .unwrap_or_else(|| PathBuf::from(".hopwire"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|h| h.join(".config")))
            .map(|p| p.join("hopwire"))
            .unwrap_or_else(|| PathBuf::from(".hopwire"))
    }
}
