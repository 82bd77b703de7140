//! Audit records for script evaluations.
//!
//! Every evaluation yields a [`ScriptAuditEntry`]: a uuid, the start time, a
//! SHA-256 hash and short preview of the script, counts of what the script did
//! and how it ended. Backends implement [`AuditLogger`].

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::SandboxMessage;

/// Maximum length of the script preview in bytes.
const SCRIPT_PREVIEW_MAX: usize = 200;

/// One evaluation, as recorded for audit.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptAuditEntry {
    /// Unique evaluation identifier.
    pub execution_id: String,
    /// When the evaluation started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the script source.
    pub script_hash: String,
    /// Leading part of the script source.
    pub script_preview: String,
    /// The request node the script belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Accepted mutation messages.
    pub mutations: usize,
    /// Validation warnings.
    pub warnings: usize,
    /// Bridge calls issued.
    pub bridge_calls: usize,
    /// Console lines.
    pub log_lines: usize,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// How it ended.
    pub outcome: ScriptOutcome,
}

/// How an evaluation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
#[non_exhaustive]
pub enum ScriptOutcome {
    /// The script completed.
    Success,
    /// The script failed.
    ScriptError {
        /// The script's error message.
        message: String,
    },
    /// The host's external timeout fired.
    Timeout,
    /// The sandbox went away or the send was cancelled before settlement.
    Cancelled,
}

impl ScriptOutcome {
    fn label(&self) -> &'static str {
        match self {
            ScriptOutcome::Success => "success",
            ScriptOutcome::ScriptError { .. } => "script_error",
            ScriptOutcome::Timeout => "timeout",
            ScriptOutcome::Cancelled => "cancelled",
        }
    }
}

/// Audit log backend.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Record one entry.
    async fn log(&self, entry: &ScriptAuditEntry);
}

/// Discards entries.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &ScriptAuditEntry) {}
}

/// Emits entries as `tracing` events at INFO with `audit = true`.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &ScriptAuditEntry) {
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            node_id = entry.node_id.as_deref().unwrap_or(""),
            script_hash = %entry.script_hash,
            duration_ms = entry.duration_ms,
            mutations = entry.mutations,
            warnings = entry.warnings,
            bridge_calls = entry.bridge_calls,
            outcome = entry.outcome.label(),
            "script audit"
        );
    }
}

/// Appends entries as JSON lines to any async sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Write to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &ScriptAuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(error = %e, "failed to flush audit log");
        }
    }
}

/// Hex SHA-256 of a string.
pub fn sha256_hex(data: &str) -> String {
    Sha256::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The first bytes of a script, cut at a char boundary, with `...` when truncated.
pub fn script_preview(script: &str) -> String {
    if script.len() <= SCRIPT_PREVIEW_MAX {
        return script.to_string();
    }
    let mut end = SCRIPT_PREVIEW_MAX;
    while !script.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &script[..end])
}

/// Accumulates counts while an evaluation runs.
pub struct ScriptAuditBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    script_hash: String,
    script_preview: String,
    node_id: Option<String>,
    mutations: usize,
    warnings: usize,
    bridge_calls: usize,
    log_lines: usize,
    start: Instant,
}

impl ScriptAuditBuilder {
    /// Start recording an evaluation of `script`.
    pub fn new(script: &str, node_id: Option<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            script_hash: sha256_hex(script),
            script_preview: script_preview(script),
            node_id,
            mutations: 0,
            warnings: 0,
            bridge_calls: 0,
            log_lines: 0,
            start: Instant::now(),
        }
    }

    /// The evaluation's id.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Count one sandbox message.
    pub fn record(&mut self, msg: &SandboxMessage) {
        match msg {
            m if m.is_mutation() => self.mutations += 1,
            SandboxMessage::Warning { .. } => self.warnings += 1,
            SandboxMessage::HttpRequest { .. } => self.bridge_calls += 1,
            SandboxMessage::Log { .. } => self.log_lines += 1,
            _ => {}
        }
    }

    /// Close the entry.
    pub fn finish(self, outcome: ScriptOutcome) -> ScriptAuditEntry {
        ScriptAuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            script_hash: self.script_hash,
            script_preview: self.script_preview,
            node_id: self.node_id,
            mutations: self.mutations,
            warnings: self.warnings,
            bridge_calls: self.bridge_calls,
            log_lines: self.log_lines,
            duration_ms: self.start.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BridgeRequest, LogLevel, ScalarField};
    use std::collections::BTreeMap;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(script_preview("af.request.method = 'POST';"), "af.request.method = 'POST';");

        let mut script = "a".repeat(199);
        script.push('\u{4E00}');
        script.push_str(&"b".repeat(50));
        let preview = script_preview(&script);
        assert!(preview.starts_with(&"a".repeat(199)));
        assert!(preview.ends_with("..."));
        assert_eq!(preview.len(), 202);
    }

    #[test]
    fn builder_counts_message_kinds() {
        let mut builder = ScriptAuditBuilder::new("x", Some("node-1".into()));
        builder.record(&SandboxMessage::FieldChanged {
            field: ScalarField::Method,
            value: "POST".into(),
        });
        builder.record(&SandboxMessage::Warning {
            message: "w".into(),
        });
        builder.record(&SandboxMessage::HttpRequest {
            request: BridgeRequest {
                id: 1,
                target: "http://x".into(),
                method: "GET".into(),
                headers: BTreeMap::new(),
                params: BTreeMap::new(),
                body: None,
                timeout_ms: None,
            },
        });
        builder.record(&SandboxMessage::Log {
            level: LogLevel::Info,
            message: "hi".into(),
        });
        builder.record(&SandboxMessage::InitializationComplete);

        let entry = builder.finish(ScriptOutcome::Success);
        assert_eq!(entry.mutations, 1);
        assert_eq!(entry.warnings, 1);
        assert_eq!(entry.bridge_calls, 1);
        assert_eq!(entry.log_lines, 1);
        assert_eq!(entry.node_id.as_deref(), Some("node-1"));
        assert_eq!(entry.script_hash, sha256_hex("x"));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(ScriptOutcome::ScriptError {
            message: "bad".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"status": "script_error", "message": "bad"}));
    }

    #[tokio::test]
    async fn json_lines_logger_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let file = tokio::fs::File::create(&path).await.unwrap();
        let logger = JsonLinesAuditLogger::new(file);

        logger
            .log(&ScriptAuditBuilder::new("a", None).finish(ScriptOutcome::Success))
            .await;
        logger
            .log(&ScriptAuditBuilder::new("b", None).finish(ScriptOutcome::Timeout))
            .await;

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["outcome"]["status"], "timeout");
        assert!(second.get("node_id").is_none());
    }
}
