use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Infrastructure failures raised by the harness itself.
///
/// A non-zero exit code from the utility is never one of these on its own;
/// it only becomes `CommandFailure` when a setup step required success.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("cannot provision {size} byte fixture at {path:?}: {reason}")]
    Provisioning {
        path: PathBuf,
        size: u64,
        reason: String,
    },

    #[error("utility binary {name:?} not found: {reason}")]
    BinaryNotFound { name: String, reason: String },

    #[error("instrumentation requested but {tool:?} is unavailable: {reason}")]
    InstrumentationUnavailable { tool: String, reason: String },

    #[error(
        "`{command}` exited with {code}\n=== stdout ===\n{stdout}\n=== stderr ===\n{stderr}"
    )]
    CommandFailure {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error(
        "`{command}` did not finish within {timeout:?}\n=== stdout so far ===\n{stdout}\n=== stderr so far ===\n{stderr}"
    )]
    Timeout {
        command: String,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}`: valgrind reported {errors} errors from {contexts} contexts\n{log}")]
    MemoryErrors {
        command: String,
        errors: u64,
        contexts: u64,
        log: String,
    },

    #[error("`{command}`: unusable valgrind log {path:?}: {reason}")]
    InstrumentationLog {
        command: String,
        path: PathBuf,
        reason: String,
    },
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
