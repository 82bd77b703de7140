//! Errors that abort a send before the real transport is invoked.
//!
//! Transport failures of the primary request are not here: they are reported
//! in [`crate::SendOutcome::response`].

use std::time::Duration;

use af_error::ResolveError;
use af_sandbox::SandboxError;
use thiserror::Error;

/// Why a send was aborted.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SendError {
    /// Template markers could not be resolved.
    #[error("template resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// The pre-request script failed to compile, threw, or left a bridge
    /// failure unhandled.
    #[error("pre-request script error: {message}")]
    Script {
        /// The script's error message.
        message: String,
        /// Stack trace, possibly empty.
        trace: String,
    },

    /// The script did not settle within the configured timeout.
    #[error("pre-request script timed out after {0:?}")]
    ScriptTimeout(Duration),

    /// The sandbox went away without settling.
    #[error("pre-request script sandbox exited before settling")]
    SandboxExited,

    /// The sandbox could not be created or reached.
    #[error("pre-request script sandbox failed: {0}")]
    Sandbox(#[from] SandboxError),
}

impl SendError {
    /// Static error code for display surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolve(_) => "RESOLVE_FAILED",
            Self::Script { .. } => "SCRIPT_ERROR",
            Self::ScriptTimeout(_) => "SCRIPT_TIMEOUT",
            Self::SandboxExited => "SANDBOX_EXITED",
            Self::Sandbox(_) => "SANDBOX_FAILED",
        }
    }

    /// Whether the failure came from the script rather than the host.
    pub fn is_script_failure(&self) -> bool {
        matches!(self, Self::Script { .. } | Self::ScriptTimeout(_))
    }
}
