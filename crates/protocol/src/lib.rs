//! hopwire Protocol
//!
//! JSON text frames exchanged with node agents over their control socket.
//!
//! ## Outbound
//!
//! `{"type": <Command>, "requestId": <id>, "data": <payload>}`, one frame per
//! command. Payloads are typed structs; JSON only exists at the socket edge.
//!
//! ## Inbound
//!
//! - `<Command>Result` frames carrying the `requestId` of the call they answer
//! - stream output for interactive sessions (`ShellOutput`, `ScriptOutput`, ...)
//! - `ServiceReport`, the agent's periodic list of running services
//! - anything else is a system-info telemetry report

mod command;
mod inbound;

pub use command::{
    Command, Diagnose, DiagnoseKind, EnableApi, GetService, LogCaptureStart, ProbePort,
    QueryServices, ReplyClass, Routing, RunScript, RunStreamScript, ServiceNames, ServiceUnit,
    SessionRef, ShellInput, ShellResize, ShellStart, SuggestPorts, UpgradeAgent, WriteFile,
    COMMAND_KINDS,
};
pub use inbound::{
    classify, DiagnoseReport, Inbound, OperationOutcome, PortProbe, PortSuggestions, Reply,
    ReportedService, ScriptOutput, ServiceList, ServiceLookup, ServiceReport, ServiceStatus,
    StreamChunk, StreamKind, RESULT_SUFFIX,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Reply {0} is missing requestId")]
    MissingRequestId(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Truncate a frame for log output, respecting char boundaries
pub fn summarize(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...({} bytes)", &text[..end], text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_short_text_untouched() {
        assert_eq!(summarize("abc", 10), "abc");
    }

    #[test]
    fn test_summarize_truncates_on_char_boundary() {
        let text = "ééééé";
        let out = summarize(text, 3);
        assert!(out.starts_with('é'));
        assert!(out.ends_with("(10 bytes)"));
    }
}
