//! Frames received from node agents

use std::collections::BTreeMap;

use hopwire_core::port_of;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{ReplyClass, COMMAND_KINDS};
use crate::{ProtocolError, Result};

/// Suffix of every correlated reply type
pub const RESULT_SUFFIX: &str = "Result";

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply(Reply),
    Stream(StreamChunk),
    ServiceReport(ServiceReport),
    Telemetry(Value),
}

/// A correlated `<Command>Result` frame
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Command kind this reply answers (without the `Result` suffix)
    pub command: String,
    pub request_id: String,
    pub data: Value,
}

impl Reply {
    pub fn class(&self) -> ReplyClass {
        if self.command == "Diagnose" {
            ReplyClass::Diagnostic
        } else {
            ReplyClass::Operation
        }
    }

    /// Decode the payload into a typed reply
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// The agent's error message when it explicitly reported `success: false`
    pub fn rejection(&self) -> Option<String> {
        match self.data.get("success").and_then(Value::as_bool) {
            Some(false) => Some(
                self.data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("agent reported failure")
                    .to_string(),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    ShellOutput,
    ScriptOutput,
    LogOutput,
    SessionClosed,
}

impl StreamKind {
    fn from_type(kind: &str) -> Option<Self> {
        match kind {
            "ShellOutput" => Some(Self::ShellOutput),
            "ScriptOutput" => Some(Self::ScriptOutput),
            "LogOutput" => Some(Self::LogOutput),
            "SessionClosed" => Some(Self::SessionClosed),
            _ => None,
        }
    }
}

/// Output of an interactive session (shell, streamed script, log capture)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    #[serde(skip, default = "default_stream_kind")]
    pub kind: StreamKind,
    pub session_id: String,
    #[serde(default)]
    pub data: String,
}

fn default_stream_kind() -> StreamKind {
    StreamKind::ShellOutput
}

/// Periodic self-report of what the agent is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceReport {
    pub services: Vec<ReportedService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedService {
    pub name: String,
    #[serde(default)]
    pub hash: String,
}

/// Classify one inbound text frame.
///
/// Frames whose `type` is neither a known reply, a stream chunk nor a
/// service report are telemetry.
pub fn classify(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed(format!("expected object, got {}", value)));
    }

    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();

    if let Some(command) = kind.strip_suffix(RESULT_SUFFIX) {
        if COMMAND_KINDS.contains(&command) {
            let request_id = value
                .get("requestId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| ProtocolError::MissingRequestId(kind.to_string()))?
                .to_string();
            return Ok(Inbound::Reply(Reply {
                command: command.to_string(),
                request_id,
                data: value.get("data").cloned().unwrap_or(Value::Null),
            }));
        }
    }

    if let Some(stream_kind) = StreamKind::from_type(kind) {
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        let mut chunk: StreamChunk = serde_json::from_value(data)?;
        chunk.kind = stream_kind;
        return Ok(Inbound::Stream(chunk));
    }

    if kind == "ServiceReport" {
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        return Ok(Inbound::ServiceReport(serde_json::from_value(data)?));
    }

    Ok(Inbound::Telemetry(value))
}

/// Generic acknowledgement of a mutation command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// A running service as the agent describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub addr: String,
    /// Absent when the agent cannot tell; callers then probe the port
    #[serde(default)]
    pub listening: Option<bool>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub hash: Option<String>,
}

impl ServiceStatus {
    pub fn port(&self) -> Option<u16> {
        port_of(&self.addr)
    }
}

/// `QueryServicesResult`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceList {
    #[serde(default)]
    pub services: Vec<ServiceStatus>,
}

/// `GetServiceResult`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceLookup {
    #[serde(default)]
    pub service: Option<ServiceStatus>,
}

/// `ProbePortResult`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortProbe {
    pub port: u16,
    pub in_use: bool,
}

/// `SuggestPortsResult`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PortSuggestions {
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// `DiagnoseResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseReport {
    pub reachable: bool,
    #[serde(default)]
    pub average_ms: Option<f64>,
    #[serde(default)]
    pub loss_percent: Option<f64>,
    #[serde(default)]
    pub message: String,
}

/// `RunScriptResult`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}
