//! Typed agent calls
//!
//! Each call sends one command and decodes its `<Command>Result` payload.
//! Service pushes and name-addressed operations go through the UDP variant
//! expansion here, so callers only ever deal with the logical services.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hopwire_core::{expand_names, expand_services, LimiterConfig, NodeId, ServiceConfig};
use hopwire_protocol::{
    Command, Diagnose, DiagnoseKind, DiagnoseReport, EnableApi, GetService, LogCaptureStart,
    OperationOutcome, PortProbe, PortSuggestions, ProbePort, QueryServices, RunScript,
    RunStreamScript, ScriptOutput, ServiceList, ServiceLookup, ServiceNames, ServiceStatus,
    ServiceUnit, SessionRef, ShellInput, ShellResize, ShellStart, StreamChunk, SuggestPorts,
    UpgradeAgent, WriteFile,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{CommandDispatcher, ControlError, Result, SessionRegistry};

const RETRY_ATTEMPTS: usize = 3;
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Per-class call deadlines
#[derive(Debug, Clone)]
pub struct RpcTimeouts {
    pub operation: Duration,
    pub diagnose: Duration,
    pub probe: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            operation: Duration::from_secs(10),
            diagnose: Duration::from_secs(30),
            probe: Duration::from_secs(3),
        }
    }
}

/// Service push flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Add,
    Update,
}

/// Run `op` up to `attempts` times, sleeping `interval` between failures
pub async fn retry_fixed<T, F, Fut>(attempts: usize, interval: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct AgentRpc {
    dispatcher: Arc<CommandDispatcher>,
    sessions: Arc<SessionRegistry>,
    timeouts: RpcTimeouts,
}

impl AgentRpc {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        sessions: Arc<SessionRegistry>,
        timeouts: RpcTimeouts,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &RpcTimeouts {
        &self.timeouts
    }

    async fn call<T: DeserializeOwned>(
        &self,
        node_id: NodeId,
        command: Command,
        timeout: Duration,
    ) -> Result<T> {
        let reply = self.dispatcher.call(node_id, &command, timeout).await?;
        if let Some(message) = reply.rejection() {
            return Err(ControlError::Rejected {
                command: command.kind().to_string(),
                message,
            });
        }
        reply
            .decode()
            .map_err(|e| ControlError::InvalidReply(format!("{}: {}", command.kind(), e)))
    }

    async fn operation(&self, node_id: NodeId, command: Command) -> Result<OperationOutcome> {
        self.call(node_id, command, self.timeouts.operation).await
    }

    // ── Services ──────────────────────────────────────────────

    /// Push services (with their UDP twins) and wait for the acknowledgement
    pub async fn push_services(
        &self,
        node_id: NodeId,
        kind: PushKind,
        services: Vec<ServiceConfig>,
    ) -> Result<OperationOutcome> {
        let services = expand_services(services);
        let command = match kind {
            PushKind::Add => Command::AddService(services),
            PushKind::Update => Command::UpdateService(services),
        };
        self.operation(node_id, command).await
    }

    pub async fn delete_services(&self, node_id: NodeId, names: &[String]) -> Result<OperationOutcome> {
        let services = expand_names(names);
        self.operation(node_id, Command::DeleteService(ServiceNames { services }))
            .await
    }

    pub async fn pause_services(&self, node_id: NodeId, names: &[String]) -> Result<OperationOutcome> {
        let services = expand_names(names);
        self.operation(node_id, Command::PauseService(ServiceNames { services }))
            .await
    }

    pub async fn resume_services(&self, node_id: NodeId, names: &[String]) -> Result<OperationOutcome> {
        let services = expand_names(names);
        self.operation(node_id, Command::ResumeService(ServiceNames { services }))
            .await
    }

    pub async fn query_services(
        &self,
        node_id: NodeId,
        filter: Option<String>,
    ) -> Result<Vec<ServiceStatus>> {
        let list: ServiceList = self
            .call(
                node_id,
                Command::QueryServices(QueryServices { filter }),
                self.timeouts.operation,
            )
            .await?;
        Ok(list.services)
    }

    pub async fn get_service(&self, node_id: NodeId, name: &str) -> Result<Option<ServiceStatus>> {
        let lookup: ServiceLookup = self
            .call(
                node_id,
                Command::GetService(GetService { name: name.to_string() }),
                self.timeouts.operation,
            )
            .await?;
        Ok(lookup.service)
    }

    // ── Ports ─────────────────────────────────────────────────

    /// Whether `port` is bound on the node right now
    pub async fn probe_port(&self, node_id: NodeId, port: u16) -> Result<bool> {
        let probe: PortProbe = self
            .call(node_id, Command::ProbePort(ProbePort { port }), self.timeouts.probe)
            .await?;
        Ok(probe.in_use)
    }

    /// OS-level free ports near `base`, as reported by the agent
    pub async fn suggest_ports(
        &self,
        node_id: NodeId,
        base: u16,
        count: u16,
        min: u16,
        max: u16,
    ) -> Result<Vec<u16>> {
        let suggestions: PortSuggestions = self
            .call(
                node_id,
                Command::SuggestPorts(SuggestPorts { base, count, min, max }),
                self.timeouts.probe,
            )
            .await?;
        Ok(suggestions.ports)
    }

    // ── Diagnostics and maintenance ───────────────────────────

    pub async fn diagnose(
        &self,
        node_id: NodeId,
        target: &str,
        kind: DiagnoseKind,
    ) -> Result<DiagnoseReport> {
        self.call(
            node_id,
            Command::Diagnose(Diagnose { target: target.to_string(), kind, count: 3 }),
            self.timeouts.diagnose,
        )
        .await
    }

    pub async fn run_script(
        &self,
        node_id: NodeId,
        script: &str,
        timeout: Duration,
    ) -> Result<ScriptOutput> {
        let command = Command::RunScript(RunScript {
            script: script.to_string(),
            timeout_secs: timeout.as_secs(),
        });
        // Reply deadline leaves room for the script's own timeout
        self.call(node_id, command, timeout + self.timeouts.operation).await
    }

    /// Write a file on the node; retried since the write is idempotent
    pub async fn write_file(
        &self,
        node_id: NodeId,
        path: &str,
        content: &str,
        mode: Option<u32>,
    ) -> Result<OperationOutcome> {
        retry_fixed(RETRY_ATTEMPTS, RETRY_INTERVAL, || {
            self.operation(
                node_id,
                Command::WriteFile(WriteFile {
                    path: path.to_string(),
                    content: content.to_string(),
                    mode,
                }),
            )
        })
        .await
    }

    pub async fn restart_service(&self, node_id: NodeId, unit: &str) -> Result<OperationOutcome> {
        retry_fixed(RETRY_ATTEMPTS, RETRY_INTERVAL, || {
            self.operation(
                node_id,
                Command::RestartService(ServiceUnit { name: unit.to_string() }),
            )
        })
        .await
    }

    pub async fn stop_service(&self, node_id: NodeId, unit: &str) -> Result<OperationOutcome> {
        self.operation(node_id, Command::StopService(ServiceUnit { name: unit.to_string() }))
            .await
    }

    pub async fn upsert_limiters(
        &self,
        node_id: NodeId,
        limiters: Vec<LimiterConfig>,
    ) -> Result<OperationOutcome> {
        self.operation(node_id, Command::UpsertLimiters(limiters)).await
    }

    pub async fn enable_api(&self, node_id: NodeId, listen: &str) -> Result<OperationOutcome> {
        self.operation(
            node_id,
            Command::EnableGostApi(EnableApi { listen: listen.to_string() }),
        )
        .await
    }

    /// Ask the agent to upgrade itself; not acknowledged
    pub async fn upgrade(&self, node_id: NodeId, version: &str, url: &str) -> Result<usize> {
        self.dispatcher
            .send(
                node_id,
                &Command::UpgradeAgent(UpgradeAgent {
                    version: version.to_string(),
                    url: url.to_string(),
                }),
            )
            .await
    }

    /// Ask the agent to remove itself; not acknowledged
    pub async fn uninstall(&self, node_id: NodeId) -> Result<usize> {
        self.dispatcher.send(node_id, &Command::UninstallAgent).await
    }

    // ── Interactive sessions ──────────────────────────────────

    async fn start_session(
        &self,
        node_id: NodeId,
        session_id: &str,
        command: Command,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let rx = self.sessions.open(node_id, session_id);
        if let Err(e) = self.dispatcher.send(node_id, &command).await {
            self.sessions.close(session_id);
            return Err(e);
        }
        Ok(rx)
    }

    pub async fn start_shell(
        &self,
        node_id: NodeId,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let command = Command::ShellStart(ShellStart {
            session_id: session_id.to_string(),
            cols,
            rows,
        });
        self.start_session(node_id, session_id, command).await
    }

    pub async fn shell_input(&self, node_id: NodeId, session_id: &str, data: &str) -> Result<()> {
        let command = Command::ShellInput(ShellInput {
            session_id: session_id.to_string(),
            data: data.to_string(),
        });
        self.dispatcher.send(node_id, &command).await.map(|_| ())
    }

    pub async fn shell_resize(
        &self,
        node_id: NodeId,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        let command = Command::ShellResize(ShellResize {
            session_id: session_id.to_string(),
            cols,
            rows,
        });
        self.dispatcher.send(node_id, &command).await.map(|_| ())
    }

    pub async fn run_stream_script(
        &self,
        node_id: NodeId,
        session_id: &str,
        script: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let command = Command::RunStreamScript(RunStreamScript {
            session_id: session_id.to_string(),
            script: script.to_string(),
        });
        self.start_session(node_id, session_id, command).await
    }

    pub async fn capture_logs(
        &self,
        node_id: NodeId,
        session_id: &str,
        unit: &str,
        lines: u32,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let command = Command::LogCaptureStart(LogCaptureStart {
            session_id: session_id.to_string(),
            unit: unit.to_string(),
            lines,
        });
        self.start_session(node_id, session_id, command).await
    }

    /// Remove the session and tell the agent to stop it.
    ///
    /// Log captures get `LogCaptureStop`; shells and streamed scripts get `ShellStop`.
    pub async fn close_session(&self, session_id: &str, log_capture: bool) -> Result<()> {
        let Some(node_id) = self.sessions.close(session_id) else {
            return Ok(());
        };
        let target = SessionRef { session_id: session_id.to_string() };
        let command = if log_capture {
            Command::LogCaptureStop(target)
        } else {
            Command::ShellStop(target)
        };
        if let Err(e) = self.dispatcher.send(node_id, &command).await {
            warn!(node_id, session_id, "Stop for closed session not delivered: {}", e);
        }
        Ok(())
    }
}
