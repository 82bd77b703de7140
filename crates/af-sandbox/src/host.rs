//! Host-side handle to one sandbox instance.
//!
//! In [`ExecutionMode::InProcess`] the isolate runs on a dedicated thread with
//! its own current-thread tokio runtime. In [`ExecutionMode::ChildProcess`] it
//! runs inside an `af-sandbox-worker` process spawned with a clean environment,
//! and messages cross stdin/stdout as length-delimited JSON frames.

use std::path::PathBuf;

use deno_core::v8;
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::error::SandboxError;
use crate::executor::{ExecutionMode, SandboxConfig, SandboxLoop, SandboxState};
use crate::model::InitialState;
use crate::protocol::{
    read_message_with_limit, write_message, HostMessage, HttpResult, SandboxMessage, WorkerConfig,
};

/// File name of the worker binary.
pub const WORKER_BINARY: &str = "af-sandbox-worker";

/// Environment variable overriding the worker location (absolute path).
pub const WORKER_BIN_ENV: &str = "AF_WORKER_BIN";

enum Teardown {
    Isolate(v8::IsolateHandle),
    Child {
        child: Child,
        pumps: Vec<JoinHandle<()>>,
    },
    Done,
}

/// Cloneable channel for answering bridge calls while the handle itself is
/// busy receiving.
#[derive(Clone)]
pub struct Responder {
    tx: UnboundedSender<HostMessage>,
}

impl Responder {
    /// Relay a successful bridge response.
    pub fn respond(&self, id: u64, result: HttpResult) -> Result<(), SandboxError> {
        self.tx
            .send(HostMessage::HttpResponse { id, result })
            .map_err(|_| SandboxError::Closed)
    }

    /// Relay a failed bridge call.
    pub fn fail(&self, id: u64, message: impl Into<String>) -> Result<(), SandboxError> {
        self.tx
            .send(HostMessage::HttpError {
                id,
                message: message.into(),
            })
            .map_err(|_| SandboxError::Closed)
    }
}

/// One sandbox instance, owned by the host for exactly one send attempt.
///
/// Dropping the handle tears the instance down: the isolate is terminated or
/// the worker killed, and any pending bridge results are abandoned.
pub struct SandboxHandle {
    tx: UnboundedSender<HostMessage>,
    rx: UnboundedReceiver<SandboxMessage>,
    state: SandboxState,
    teardown: Teardown,
}

impl SandboxHandle {
    /// Spawn a fresh sandbox instance.
    pub async fn spawn(config: &SandboxConfig) -> Result<Self, SandboxError> {
        tracing::debug!(mode = ?config.execution_mode, "spawning sandbox");
        match config.execution_mode {
            ExecutionMode::InProcess => Self::spawn_in_process(config.clone()).await,
            ExecutionMode::ChildProcess => Self::spawn_child(config).await,
        }
    }

    async fn spawn_in_process(config: SandboxConfig) -> Result<Self, SandboxError> {
        let (host_tx, sandbox_rx) = mpsc::unbounded_channel();
        let (sandbox_tx, host_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        std::thread::Builder::new()
            .name("af-sandbox".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if ready_tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                            tracing::warn!("sandbox spawner dropped");
                        }
                        return;
                    }
                };
                rt.block_on(async move {
                    let mut sandbox = match SandboxLoop::new(config, sandbox_rx, sandbox_tx) {
                        Ok(sandbox) => sandbox,
                        Err(e) => {
                            if ready_tx.send(Err(e)).is_err() {
                                tracing::warn!("sandbox spawner dropped");
                            }
                            return;
                        }
                    };
                    if ready_tx.send(Ok(sandbox.isolate_handle())).is_err() {
                        tracing::warn!("sandbox spawner dropped before the isolate was ready");
                        return;
                    }
                    let state = sandbox.run().await;
                    tracing::debug!(?state, "sandbox thread exiting");
                });
            })
            .map_err(|e| SandboxError::Execution(e.into()))?;

        let isolate = ready_rx
            .await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))??;

        Ok(Self {
            tx: host_tx,
            rx: host_rx,
            state: SandboxState::Uninitialized,
            teardown: Teardown::Isolate(isolate),
        })
    }

    async fn spawn_child(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let worker_bin = find_worker_binary()?;
        let max_frame = config.max_ipc_message_size;

        let mut command = Command::new(&worker_bin);
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .env_clear()
            .kill_on_drop(true);
        if std::env::var("AF_DEBUG").is_ok() {
            command.stderr(std::process::Stdio::inherit());
            if let Ok(filter) = std::env::var("RUST_LOG") {
                command.env("RUST_LOG", filter);
            }
        } else {
            command.stderr(std::process::Stdio::null());
        }

        let mut child = command.spawn().map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "failed to spawn worker at {}: {}",
                worker_bin.display(),
                e
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on child")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on child")))?;
        let mut stdout = BufReader::new(stdout);

        write_message(&mut stdin, &WorkerConfig::from(config))
            .await
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!("failed to send worker config: {}", e))
            })?;

        let (host_tx, mut to_worker) = mpsc::unbounded_channel::<HostMessage>();
        let (from_worker, host_rx) = mpsc::unbounded_channel::<SandboxMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = to_worker.recv().await {
                if let Err(e) = write_message(&mut stdin, &msg).await {
                    tracing::warn!(error = %e, "failed to write to sandbox worker");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            loop {
                match read_message_with_limit::<SandboxMessage, _>(&mut stdout, max_frame).await {
                    Ok(Some(msg)) => {
                        if from_worker.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read from sandbox worker");
                        break;
                    }
                }
            }
        });

        tracing::debug!(worker = %worker_bin.display(), "sandbox worker started");

        Ok(Self {
            tx: host_tx,
            rx: host_rx,
            state: SandboxState::Uninitialized,
            teardown: Teardown::Child {
                child,
                pumps: vec![writer, reader],
            },
        })
    }

    /// Send the seed snapshot.
    pub fn initialize(&mut self, seed: InitialState) -> Result<(), SandboxError> {
        self.post(HostMessage::Initialize {
            state: Box::new(seed),
        })?;
        if matches!(self.state, SandboxState::Uninitialized | SandboxState::Ready) {
            self.state = SandboxState::Initializing;
        }
        Ok(())
    }

    /// Send the script to run.
    pub fn evaluate(&mut self, script: impl Into<String>) -> Result<(), SandboxError> {
        self.post(HostMessage::Evaluate {
            script: script.into(),
        })?;
        if self.state == SandboxState::Ready {
            self.state = SandboxState::Evaluating;
        }
        Ok(())
    }

    /// A cloneable channel for replying to bridge calls.
    pub fn responder(&self) -> Responder {
        Responder {
            tx: self.tx.clone(),
        }
    }

    /// Receive the next message. `None` once the sandbox side has gone away.
    pub async fn recv(&mut self) -> Option<SandboxMessage> {
        let msg = self.rx.recv().await?;
        self.observe(&msg);
        Some(msg)
    }

    /// The host's view of the instance state, derived from messages seen so far.
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Tear the instance down without waiting for the script.
    pub fn cancel(&mut self) {
        match std::mem::replace(&mut self.teardown, Teardown::Done) {
            Teardown::Isolate(isolate) => {
                tracing::debug!("terminating sandbox isolate");
                isolate.terminate_execution();
            }
            Teardown::Child { mut child, pumps } => {
                tracing::debug!("killing sandbox worker");
                for pump in pumps {
                    pump.abort();
                }
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "sandbox worker already exited");
                }
            }
            Teardown::Done => {}
        }
        self.rx.close();
    }

    fn post(&self, msg: HostMessage) -> Result<(), SandboxError> {
        self.tx.send(msg).map_err(|_| SandboxError::Closed)
    }

    fn observe(&mut self, msg: &SandboxMessage) {
        match msg {
            SandboxMessage::InitializationComplete => self.state = SandboxState::Ready,
            SandboxMessage::EvaluateSuccess { .. } => self.state = SandboxState::SettledSuccess,
            SandboxMessage::EvaluateError { .. } => self.state = SandboxState::SettledError,
            _ => {}
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Find the worker binary.
///
/// Search order:
/// 1. `AF_WORKER_BIN` (must be an absolute path)
/// 2. Next to the current executable, or its parent (test binaries live in `deps/`)
///
/// On Unix, world-writable binaries are rejected.
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        for _ in 0..2 {
            let Some(d) = dir else { break };
            let worker = d.join(WORKER_BINARY);
            if worker.exists() {
                validate_binary_permissions(&worker)?;
                return Ok(worker);
            }
            dir = d.parent();
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BINARY} binary not found. Set {WORKER_BIN_ENV} or install it next to the host executable"
    )))
}

fn validate_binary_permissions(_path: &std::path::Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn worker_env_var_must_be_absolute() {
        std::env::set_var(WORKER_BIN_ENV, "./relative/af-sandbox-worker");
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "expected 'absolute' in error: {err}");
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn world_writable_worker_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BINARY);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);

        let err = result.unwrap_err().to_string();
        assert!(err.contains("insecure"), "expected 'insecure' in error: {err}");
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn secure_worker_is_accepted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BINARY);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);

        assert_eq!(result.unwrap(), bin);
    }

    #[test]
    #[serial]
    fn missing_worker_error_names_the_env_var() {
        std::env::remove_var(WORKER_BIN_ENV);
        if let Err(e) = find_worker_binary() {
            let msg = e.to_string();
            assert!(msg.contains(WORKER_BIN_ENV), "error should guide user: {msg}");
        }
    }

    #[tokio::test]
    async fn handle_tracks_state_from_messages() {
        let mut handle = SandboxHandle::spawn(&SandboxConfig::default()).await.unwrap();
        assert_eq!(handle.state(), SandboxState::Uninitialized);

        handle.initialize(InitialState::default()).unwrap();
        assert_eq!(handle.state(), SandboxState::Initializing);
        assert_eq!(
            handle.recv().await,
            Some(SandboxMessage::InitializationComplete)
        );
        assert_eq!(handle.state(), SandboxState::Ready);

        handle.evaluate("").unwrap();
        assert_eq!(handle.state(), SandboxState::Evaluating);
        assert!(matches!(
            handle.recv().await,
            Some(SandboxMessage::EvaluateSuccess { .. })
        ));
        assert_eq!(handle.state(), SandboxState::SettledSuccess);

        // the loop exits after its single evaluation
        assert_eq!(handle.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_closes_the_stream() {
        let mut handle = SandboxHandle::spawn(&SandboxConfig::default()).await.unwrap();
        handle.initialize(InitialState::default()).unwrap();
        handle.cancel();
        // buffered messages may still drain, but the stream ends
        let mut drained = 0;
        while handle.recv().await.is_some() {
            drained += 1;
        }
        assert!(drained <= 1);
    }
}
