//! Pre-flight checks on script source.
//!
//! Only limits that hold regardless of what the source means are checked here.
//! Everything else, including reaching for globals the isolate does not have,
//! surfaces as a compile or runtime error of the script itself.

use crate::error::SandboxError;

/// Default maximum script size in bytes (256 KB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 256 * 1024;

/// Validate a script before it is compiled. Empty scripts are valid.
pub fn validate_script(script: &str, max_size: usize) -> Result<(), SandboxError> {
    if script.len() > max_size {
        return Err(SandboxError::ScriptTooLarge {
            max: max_size,
            actual: script.len(),
        });
    }

    if script.bytes().any(|b| b == 0) {
        return Err(SandboxError::ValidationFailed {
            reason: "script contains a NUL byte".into(),
        });
    }

    Ok(())
}
