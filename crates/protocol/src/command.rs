//! Commands sent to node agents

use hopwire_core::{LimiterConfig, ServiceConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProtocolError, Result};

/// Every command kind the panel issues; `<kind>Result` is the matching reply type
pub const COMMAND_KINDS: &[&str] = &[
    "AddService",
    "UpdateService",
    "DeleteService",
    "PauseService",
    "ResumeService",
    "QueryServices",
    "GetService",
    "ProbePort",
    "SuggestPorts",
    "Diagnose",
    "RunScript",
    "WriteFile",
    "RestartService",
    "StopService",
    "UpgradeAgent",
    "ShellStart",
    "ShellInput",
    "ShellResize",
    "ShellStop",
    "UninstallAgent",
    "RunStreamScript",
    "LogCaptureStart",
    "LogCaptureStop",
    "EnableGostAPI",
    "UpsertLimiters",
];

/// How a command is delivered across a node's live connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Every live connection, in registration order
    Broadcast,
    /// The connection tagged with the primary agent role, else any one
    Exclusive,
}

/// Which correlation table waits for the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Operation,
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Command {
    AddService(Vec<ServiceConfig>),
    UpdateService(Vec<ServiceConfig>),
    DeleteService(ServiceNames),
    PauseService(ServiceNames),
    ResumeService(ServiceNames),
    QueryServices(QueryServices),
    GetService(GetService),
    ProbePort(ProbePort),
    SuggestPorts(SuggestPorts),
    Diagnose(Diagnose),
    RunScript(RunScript),
    WriteFile(WriteFile),
    RestartService(ServiceUnit),
    StopService(ServiceUnit),
    UpgradeAgent(UpgradeAgent),
    ShellStart(ShellStart),
    ShellInput(ShellInput),
    ShellResize(ShellResize),
    ShellStop(SessionRef),
    UninstallAgent,
    RunStreamScript(RunStreamScript),
    LogCaptureStart(LogCaptureStart),
    LogCaptureStop(SessionRef),
    #[serde(rename = "EnableGostAPI")]
    EnableGostApi(EnableApi),
    UpsertLimiters(Vec<LimiterConfig>),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::AddService(_) => "AddService",
            Command::UpdateService(_) => "UpdateService",
            Command::DeleteService(_) => "DeleteService",
            Command::PauseService(_) => "PauseService",
            Command::ResumeService(_) => "ResumeService",
            Command::QueryServices(_) => "QueryServices",
            Command::GetService(_) => "GetService",
            Command::ProbePort(_) => "ProbePort",
            Command::SuggestPorts(_) => "SuggestPorts",
            Command::Diagnose(_) => "Diagnose",
            Command::RunScript(_) => "RunScript",
            Command::WriteFile(_) => "WriteFile",
            Command::RestartService(_) => "RestartService",
            Command::StopService(_) => "StopService",
            Command::UpgradeAgent(_) => "UpgradeAgent",
            Command::ShellStart(_) => "ShellStart",
            Command::ShellInput(_) => "ShellInput",
            Command::ShellResize(_) => "ShellResize",
            Command::ShellStop(_) => "ShellStop",
            Command::UninstallAgent => "UninstallAgent",
            Command::RunStreamScript(_) => "RunStreamScript",
            Command::LogCaptureStart(_) => "LogCaptureStart",
            Command::LogCaptureStop(_) => "LogCaptureStop",
            Command::EnableGostApi(_) => "EnableGostAPI",
            Command::UpsertLimiters(_) => "UpsertLimiters",
        }
    }

    /// Live diagnostics, probes and interactive sessions go to one connection;
    /// everything that mutates agent state is broadcast so a stale socket
    /// cannot swallow it.
    pub fn routing(&self) -> Routing {
        match self {
            Command::QueryServices(_)
            | Command::GetService(_)
            | Command::ProbePort(_)
            | Command::SuggestPorts(_)
            | Command::Diagnose(_)
            | Command::ShellStart(_)
            | Command::ShellInput(_)
            | Command::ShellResize(_)
            | Command::ShellStop(_)
            | Command::RunStreamScript(_)
            | Command::LogCaptureStart(_)
            | Command::LogCaptureStop(_) => Routing::Exclusive,
            _ => Routing::Broadcast,
        }
    }

    pub fn reply_class(&self) -> ReplyClass {
        match self {
            Command::Diagnose(_) => ReplyClass::Diagnostic,
            _ => ReplyClass::Operation,
        }
    }

    /// Encode as one outbound text frame
    pub fn encode(&self, request_id: &str) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        match value.as_object_mut() {
            Some(map) => {
                map.insert("requestId".to_string(), Value::from(request_id));
            }
            None => return Err(ProtocolError::Malformed("command is not an object".into())),
        }
        Ok(value.to_string())
    }

    /// Decode an outbound frame (agent side); returns the command and its request id
    pub fn decode(text: &str) -> Result<(Command, String)> {
        let value: Value = serde_json::from_str(text)?;
        let request_id = value
            .get("requestId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let command = serde_json::from_value(value)?;
        Ok((command, request_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNames {
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueryServices {
    /// Optional name prefix filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetService {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePort {
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestPorts {
    pub base: u16,
    pub count: u16,
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiagnoseKind {
    #[default]
    Tcp,
    Icmp,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnose {
    pub target: String,
    #[serde(default)]
    pub kind: DiagnoseKind,
    #[serde(default = "default_probe_count")]
    pub count: u32,
}

fn default_probe_count() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScript {
    pub script: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUnit {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAgent {
    pub version: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellStart {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellInput {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellResize {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStreamScript {
    pub session_id: String,
    pub script: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCaptureStart {
    pub session_id: String,
    pub unit: String,
    pub lines: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableApi {
    pub listen: String,
}
