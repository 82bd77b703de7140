//! The message contract between host and sandbox.
//!
//! Messages are the only channel connecting the two sides. In-process they travel
//! over ordered tokio channels; to a child worker they are length-delimited JSON
//! frames: a 4-byte big-endian length prefix followed by the JSON payload.

use std::collections::BTreeMap;
use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::model::{BinaryBody, InitialState};
use crate::store::{Change, StoreName};

/// Messages sent from the host to the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    /// Seed every store from a resolved snapshot. Emission is suppressed while seeding.
    Initialize {
        /// The full seed snapshot.
        state: Box<InitialState>,
    },
    /// Compile and run a script against the seeded context.
    Evaluate {
        /// Script body source text.
        script: String,
    },
    /// Successful completion of a bridge call.
    HttpResponse {
        /// Correlation id from the matching `http-request`.
        id: u64,
        /// The response.
        result: HttpResult,
    },
    /// Failed bridge call.
    HttpError {
        /// Correlation id from the matching `http-request`.
        id: u64,
        /// Failure reason, surfaced to the script as the rejection message.
        message: String,
    },
}

impl HostMessage {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Initialize { .. } => "initialize",
            HostMessage::Evaluate { .. } => "evaluate",
            HostMessage::HttpResponse { .. } => "http-response",
            HostMessage::HttpError { .. } => "http-error",
        }
    }
}

/// Messages sent from the sandbox to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SandboxMessage {
    /// Acknowledges `initialize`.
    InitializationComplete,
    /// The script finished. `context` is a diagnostic echo of the whole AF context.
    EvaluateSuccess {
        /// Full context echo.
        context: Box<InitialState>,
    },
    /// The script failed to compile or threw.
    EvaluateError {
        /// Error message.
        message: String,
        /// Stack trace, or empty when none is available.
        #[serde(default)]
        trace: String,
    },
    /// A field store accepted a mutation.
    StoreChanged {
        /// Which store.
        store: StoreName,
        /// Set or delete.
        change: Change,
        /// The key written or deleted; absent for whole-store replacement.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        /// Complete snapshot of the store after the mutation.
        snapshot: Value,
    },
    /// A scalar request field changed.
    FieldChanged {
        /// Which field.
        field: ScalarField,
        /// The new value.
        value: String,
    },
    /// The raw body text changed.
    RawBodyChanged {
        /// New raw body.
        value: String,
    },
    /// The binary body descriptor changed.
    BinaryBodyChanged {
        /// New descriptor.
        value: BinaryBody,
    },
    /// The script issued a bridge call.
    HttpRequest {
        /// Call description.
        request: BridgeRequest,
    },
    /// A non-fatal validation warning.
    Warning {
        /// Human-readable description.
        message: String,
    },
    /// A console line from the script.
    Log {
        /// Console level.
        level: LogLevel,
        /// Formatted line.
        message: String,
    },
}

impl SandboxMessage {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxMessage::InitializationComplete => "initialization-complete",
            SandboxMessage::EvaluateSuccess { .. } => "evaluate-success",
            SandboxMessage::EvaluateError { .. } => "evaluate-error",
            SandboxMessage::StoreChanged { .. } => "store-changed",
            SandboxMessage::FieldChanged { .. } => "field-changed",
            SandboxMessage::RawBodyChanged { .. } => "raw-body-changed",
            SandboxMessage::BinaryBodyChanged { .. } => "binary-body-changed",
            SandboxMessage::HttpRequest { .. } => "http-request",
            SandboxMessage::Warning { .. } => "warning",
            SandboxMessage::Log { .. } => "log",
        }
    }

    /// Whether this message mutates the request under construction.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            SandboxMessage::StoreChanged { .. }
                | SandboxMessage::FieldChanged { .. }
                | SandboxMessage::RawBodyChanged { .. }
                | SandboxMessage::BinaryBodyChanged { .. }
        )
    }

    /// Whether this message ends an evaluation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SandboxMessage::EvaluateSuccess { .. } | SandboxMessage::EvaluateError { .. }
        )
    }
}

/// Scalar request fields carried by `field-changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalarField {
    /// HTTP method.
    Method,
    /// Target URL.
    Url,
    /// Request path.
    Path,
    /// Active body variant.
    BodyType,
}

/// Console level of a `log` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.debug`
    Debug,
    /// `console.log` / `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl LogLevel {
    /// Parse a console level name; unknown names map to `Info`.
    pub fn parse(name: &str) -> Self {
        match name {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// A script-initiated HTTP call, delegated to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// Correlation id.
    pub id: u64,
    /// Target URL.
    pub target: String,
    /// HTTP method, upper-cased.
    pub method: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query parameters appended to `target`.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Request body. Strings are sent verbatim, anything else as JSON.
    #[serde(default)]
    pub body: Option<Value>,
    /// Per-call timeout in milliseconds, `timeout` on the wire.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
}

/// The host's answer to a bridge call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResult {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response body as text.
    pub body: String,
    /// `body` parsed as JSON, when it is JSON.
    #[serde(default)]
    pub parsed_body: Option<Value>,
}

impl HttpResult {
    /// Build a result, parsing the body as JSON when possible.
    pub fn new(
        status: u16,
        status_text: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: impl Into<String>,
    ) -> Self {
        let body = body.into();
        let parsed_body = serde_json::from_str(&body).ok();
        Self {
            status,
            status_text: status_text.into(),
            headers,
            body,
            parsed_body,
        }
    }

    /// The object a script sees when its call settles.
    pub fn script_view(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "statusText": self.status_text,
            "headers": self.headers,
            "body": self.body,
            "data": self.parsed_body,
        })
    }
}

/// Configuration sent as the first frame to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum script size in bytes.
    pub max_script_size: usize,
    /// Maximum serialized size of one storage value in bytes.
    pub max_storage_value_size: usize,
    /// Maximum IPC frame size in bytes. Defaults to [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl From<&crate::SandboxConfig> for WorkerConfig {
    fn from(config: &crate::SandboxConfig) -> Self {
        Self {
            max_script_size: config.max_script_size,
            max_storage_value_size: config.max_storage_value_size,
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }
}

impl WorkerConfig {
    /// Convert back to a SandboxConfig for use in the worker.
    pub fn to_sandbox_config(&self) -> crate::SandboxConfig {
        crate::SandboxConfig {
            max_script_size: self.max_script_size,
            max_storage_value_size: self.max_storage_value_size,
            max_ipc_message_size: self.max_ipc_message_size,
            // the worker always hosts its loop in-process
            execution_mode: crate::ExecutionMode::InProcess,
        }
    }
}

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Write one frame: a 4-byte big-endian payload length, then the JSON payload.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> io::Result<()> {
    let payload = serde_json::to_vec(msg).map_err(|e| invalid_data(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| invalid_data(format!("frame too large: {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one frame, rejecting payloads above `max_size` before allocating.
///
/// A clean EOF before the length prefix yields `None`.
pub async fn read_message_with_limit<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> io::Result<Option<T>> {
    let mut prefix = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut prefix).await {
        return match e.kind() {
            io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(e),
        };
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_size {
        return Err(invalid_data(format!(
            "frame too large: {len} bytes (limit: {max_size} bytes)"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| invalid_data(e.to_string()))
}

/// [`read_message_with_limit`] with [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
pub async fn read_message<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<T>> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}
