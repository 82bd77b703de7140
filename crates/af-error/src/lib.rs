#![warn(missing_docs)]

//! Typed error types for the external interfaces the pre-request host consumes.
//!
//! [`TransportError`] is the error type of every `Transport` implementation,
//! used for the primary send and for script-initiated bridge calls.
//! [`ResolveError`] covers the template resolution seam.

use thiserror::Error;

/// Canonical error type for transport operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The prepared request could not be turned into a wire request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The target host name could not be resolved.
    #[error("could not resolve host '{host}'")]
    Resolve {
        /// The host that failed to resolve.
        host: String,
    },

    /// The connection or TLS handshake failed.
    #[error("connection to '{target}' failed: {message}")]
    Connect {
        /// The request target.
        target: String,
        /// Underlying failure description.
        message: String,
    },

    /// The request did not complete in time.
    #[error("request to '{target}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The request target.
        target: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The request was aborted before a response arrived.
    #[error("request aborted")]
    Aborted,

    /// A local file referenced by the request body could not be read.
    #[error("failed to read body file '{path}': {message}")]
    BodyFile {
        /// Path that was read.
        path: String,
        /// Underlying failure description.
        message: String,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TransportError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Resolve { .. } => "RESOLVE_FAILED",
            Self::Connect { .. } => "CONNECT_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Aborted => "ABORTED",
            Self::BodyFile { .. } => "BODY_FILE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Connect { .. } => true,
            Self::Resolve { .. } => true,
            Self::InvalidRequest(_) => false,
            Self::Aborted => false,
            Self::BodyFile { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error object for display surfaces.
    pub fn to_structured_error(&self) -> serde_json::Value {
        serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        })
    }
}

/// Errors from the template-resolution service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// A `{{name}}` marker referenced a variable that does not exist.
    #[error("unresolved variable '{0}'")]
    UnknownVariable(String),

    /// An internal error inside the resolver.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

// Both error types cross task boundaries inside the orchestrator.
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<TransportError>();
    assert_bounds::<ResolveError>();
};
