//! Error types for the pre-request sandbox.

use thiserror::Error;

/// Errors raised while creating, driving or talking to a sandbox instance.
///
/// Script failures are not represented here: they travel to the host as an
/// `evaluate-error` message. These are failures of the sandbox machinery itself.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Script source exceeds the configured maximum size.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    ScriptTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Script source failed a pre-flight check.
    #[error("script validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// The JavaScript bootstrap or a host-driven script call threw.
    #[error("javascript error: {message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
    },

    /// The message channel to the sandbox is closed.
    #[error("sandbox channel closed")]
    Closed,

    /// A frame arrived that the receiver cannot interpret in its current state.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Generic failure of the sandbox machinery.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Message serialization failed.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
