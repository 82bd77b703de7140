//! The single send entry point: resolve, run the pre-request script in a fresh
//! sandbox, fold its mutations into the working copy, then transmit.

use std::sync::Arc;
use std::time::Duration;

use af_config::AfConfig;
use af_error::TransportError;
use af_sandbox::audit::{AuditLogger, ScriptAuditBuilder, ScriptOutcome, TracingAuditLogger};
use af_sandbox::{
    ExecutionMode, HttpResult, InitialState, LogLevel, Responder, SandboxConfig, SandboxError,
    SandboxHandle, SandboxMessage,
};
use tokio::task::JoinSet;

use crate::error::SendError;
use crate::node::RequestNode;
use crate::resolve::{PassthroughResolver, TemplateResolver};
use crate::storage::{MemoryStorageCache, NodeStorage, StorageCache};
use crate::transport::{
    prepare_request, PreparedRequest, ReqwestTransport, Transport, TransportConfig,
};
use crate::working::WorkingCopy;

/// Default external evaluation timeout.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sandbox limits and isolation mode.
    pub sandbox: SandboxConfig,
    /// External evaluation timeout; `None` waits indefinitely.
    pub script_timeout: Option<Duration>,
    /// Settings for the default transport.
    pub transport: TransportConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            script_timeout: Some(DEFAULT_SCRIPT_TIMEOUT),
            transport: TransportConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Apply file overrides to the defaults.
    pub fn from_config(config: &AfConfig) -> Self {
        let mut out = Self::default();
        let sandbox = &config.sandbox;
        if let Some(mode) = sandbox.execution_mode.as_deref() {
            out.sandbox.execution_mode = match mode {
                "child_process" => ExecutionMode::ChildProcess,
                _ => ExecutionMode::InProcess,
            };
        }
        if let Some(kb) = sandbox.max_script_size_kb {
            out.sandbox.max_script_size = kb * 1024;
        }
        if let Some(kb) = sandbox.max_storage_value_kb {
            out.sandbox.max_storage_value_size = kb * 1024;
        }
        if let Some(mb) = sandbox.max_ipc_message_size_mb {
            out.sandbox.max_ipc_message_size = mb * 1024 * 1024;
        }
        if let Some(secs) = sandbox.script_timeout_secs {
            out.script_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        let transport = &config.transport;
        if let Some(secs) = transport.timeout_secs {
            out.transport.timeout = Duration::from_secs(secs);
        }
        if let Some(agent) = &transport.user_agent {
            out.transport.user_agent = agent.clone();
        }
        if let Some(max) = transport.max_redirects {
            out.transport.max_redirects = max;
        }
        out
    }
}

/// A console line from the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLog {
    /// Console level.
    pub level: LogLevel,
    /// Formatted line.
    pub message: String,
}

/// Result of a send that got as far as the transport.
#[derive(Debug)]
pub struct SendOutcome {
    /// The request as transmitted; `None` if it could not be prepared.
    pub request: Option<PreparedRequest>,
    /// The primary transport result.
    pub response: Result<HttpResult, TransportError>,
    /// Whether a pre-request script ran.
    pub script_ran: bool,
    /// Mutation messages applied to the working copy.
    pub mutations_applied: usize,
    /// Validation warnings raised by the script.
    pub warnings: Vec<String>,
    /// Console output of the script.
    pub logs: Vec<ScriptLog>,
}

#[derive(Default)]
struct ScriptReport {
    ran: bool,
    mutations: usize,
    warnings: Vec<String>,
    logs: Vec<ScriptLog>,
}

enum Interrupted {
    Script { message: String, trace: String },
    Exited,
    Sandbox(SandboxError),
}

impl From<SandboxError> for Interrupted {
    fn from(e: SandboxError) -> Self {
        Interrupted::Sandbox(e)
    }
}

/// Drives one sandbox per send and transmits the resulting request.
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn TemplateResolver>,
    storage: Arc<dyn StorageCache>,
    audit: Arc<dyn AuditLogger>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator over `transport` with pass-through resolution,
    /// an in-memory storage cache and tracing audit.
    pub fn new(transport: Arc<dyn Transport>, config: OrchestratorConfig) -> Self {
        Self {
            transport,
            resolver: Arc::new(PassthroughResolver),
            storage: Arc::new(MemoryStorageCache::default()),
            audit: Arc::new(TracingAuditLogger),
            config,
        }
    }

    /// Create an orchestrator with a `reqwest` transport built from `config`.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(config.transport.clone())?;
        Ok(Self::new(Arc::new(transport), config))
    }

    /// Use `resolver` for template markers.
    pub fn with_resolver(mut self, resolver: Arc<dyn TemplateResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Persist script storage in `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn StorageCache>) -> Self {
        self.storage = storage;
        self
    }

    /// Record evaluations with `audit`.
    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Send the request of `node`, running its pre-request script first.
    ///
    /// Script failures abort the send and the transport is never invoked.
    /// Primary transport failures are returned in [`SendOutcome::response`].
    pub async fn send(&self, node: &RequestNode) -> Result<SendOutcome, SendError> {
        tracing::info!(node_id = %node.id, "send: starting");
        let resolved = self.resolver.resolve(node).await?;
        let stored = self.storage.load(&node.id).await;
        let seed = resolved.initial_state(stored.local, stored.session);

        let (state, report) = match resolved.script() {
            None => {
                tracing::debug!(node_id = %node.id, "no pre-request script");
                (seed, ScriptReport::default())
            }
            Some(script) => {
                let (state, report) = self.run_script(seed, script, &node.id).await?;
                self.storage
                    .store(
                        &node.id,
                        NodeStorage {
                            local: state.local_storage.clone(),
                            session: state.session_storage.clone(),
                        },
                    )
                    .await;
                (state, report)
            }
        };

        let (request, response) = match prepare_request(&state) {
            Ok(prepared) => {
                let response = self.transport.send(&prepared).await;
                (Some(prepared), response)
            }
            Err(e) => (None, Err(e)),
        };
        match &response {
            Ok(result) => tracing::info!(node_id = %node.id, status = result.status, "send: complete"),
            Err(e) => tracing::warn!(node_id = %node.id, code = e.code(), error = %e, "send: transport failed"),
        }

        Ok(SendOutcome {
            request,
            response,
            script_ran: report.ran,
            mutations_applied: report.mutations,
            warnings: report.warnings,
            logs: report.logs,
        })
    }

    async fn run_script(
        &self,
        seed: InitialState,
        script: &str,
        node_id: &str,
    ) -> Result<(InitialState, ScriptReport), SendError> {
        let mut session = ScriptSession {
            handle: SandboxHandle::spawn(&self.config.sandbox).await?,
            working: WorkingCopy::new(seed.clone()),
            report: ScriptReport {
                ran: true,
                ..ScriptReport::default()
            },
            audit: ScriptAuditBuilder::new(script, Some(node_id.to_string())),
            bridge: JoinSet::new(),
            node_id,
        };
        tracing::debug!(node_id, execution_id = session.audit.execution_id(), "script: starting");

        let driven = session.drive(seed, script, &self.transport);
        let result = match self.config.script_timeout {
            Some(limit) => match tokio::time::timeout(limit, driven).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(node_id, timeout = ?limit, "script: timed out, cancelling sandbox");
                    session.handle.cancel();
                    session.bridge.abort_all();
                    self.audit
                        .log(&session.audit.finish(ScriptOutcome::Timeout))
                        .await;
                    return Err(SendError::ScriptTimeout(limit));
                }
            },
            None => driven.await,
        };
        session.bridge.abort_all();

        let ScriptSession {
            working,
            mut report,
            audit,
            ..
        } = session;
        let (outcome, result) = match result {
            Ok(()) => (ScriptOutcome::Success, Ok(())),
            Err(Interrupted::Script { message, trace }) => (
                ScriptOutcome::ScriptError {
                    message: message.clone(),
                },
                Err(SendError::Script { message, trace }),
            ),
            Err(Interrupted::Exited) => (ScriptOutcome::Cancelled, Err(SendError::SandboxExited)),
            Err(Interrupted::Sandbox(e)) => (ScriptOutcome::Cancelled, Err(SendError::Sandbox(e))),
        };
        self.audit.log(&audit.finish(outcome)).await;
        result?;

        report.mutations = working.applied();
        tracing::debug!(node_id, mutations = report.mutations, "script: complete");
        Ok((working.into_state(), report))
    }
}

struct ScriptSession<'a> {
    handle: SandboxHandle,
    working: WorkingCopy,
    report: ScriptReport,
    audit: ScriptAuditBuilder,
    bridge: JoinSet<()>,
    node_id: &'a str,
}

impl ScriptSession<'_> {
    async fn drive(
        &mut self,
        seed: InitialState,
        script: &str,
        transport: &Arc<dyn Transport>,
    ) -> Result<(), Interrupted> {
        self.handle.initialize(seed)?;
        loop {
            match self.handle.recv().await {
                Some(SandboxMessage::InitializationComplete) => break,
                Some(other) => self.observe(other),
                None => return Err(Interrupted::Exited),
            }
        }

        self.handle.evaluate(script)?;
        let responder = self.handle.responder();
        loop {
            let msg = self.handle.recv().await.ok_or(Interrupted::Exited)?;
            self.audit.record(&msg);
            match msg {
                SandboxMessage::EvaluateSuccess { .. } => return Ok(()),
                SandboxMessage::EvaluateError { message, trace } => {
                    return Err(Interrupted::Script { message, trace })
                }
                SandboxMessage::HttpRequest { request } => {
                    tracing::debug!(
                        node_id = self.node_id,
                        id = request.id,
                        method = %request.method,
                        target = %request.target,
                        "bridge call"
                    );
                    let transport = Arc::clone(transport);
                    let responder = responder.clone();
                    self.bridge
                        .spawn(bridge_call(transport, responder, request));
                }
                other => self.observe(other),
            }
        }
    }

    fn observe(&mut self, msg: SandboxMessage) {
        match msg {
            SandboxMessage::Warning { message } => {
                tracing::warn!(target: "af::script", node_id = self.node_id, "{}", message);
                self.report.warnings.push(message);
            }
            SandboxMessage::Log { level, message } => {
                match level {
                    LogLevel::Debug => tracing::debug!(target: "af::script", node_id = self.node_id, "{}", message),
                    LogLevel::Info => tracing::info!(target: "af::script", node_id = self.node_id, "{}", message),
                    LogLevel::Warn => tracing::warn!(target: "af::script", node_id = self.node_id, "{}", message),
                    LogLevel::Error => tracing::error!(target: "af::script", node_id = self.node_id, "{}", message),
                }
                self.report.logs.push(ScriptLog { level, message });
            }
            m if m.is_mutation() => {
                self.working.apply(&m);
            }
            other => tracing::debug!(kind = other.kind(), "sandbox message ignored"),
        }
    }
}

async fn bridge_call(
    transport: Arc<dyn Transport>,
    responder: Responder,
    request: af_sandbox::BridgeRequest,
) {
    let id = request.id;
    let result = match PreparedRequest::from_bridge(&request) {
        Ok(prepared) => transport.send(&prepared).await,
        Err(e) => Err(e),
    };
    let replied = match result {
        Ok(response) => {
            tracing::debug!(id, status = response.status, "bridge call answered");
            responder.respond(id, response)
        }
        Err(e) => {
            tracing::debug!(id, code = e.code(), error = %e, "bridge call failed");
            responder.fail(id, e.to_string())
        }
    };
    if replied.is_err() {
        tracing::debug!(id, "sandbox gone before bridge reply");
    }
}
