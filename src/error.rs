//! Error taxonomy shared by the sandbox runner, the expert dispatcher
//! and the tool layer.
//!
//! A non-zero exit code from a sandboxed script is *not* an error: it is
//! reported as a normal `ExecutionResult`. Temp-file cleanup failures are
//! logged where they happen and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    /// Invalid capability scope, unresolved answer reference, out-of-range
    /// expert count, unknown provider. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Interpreter binary missing, temp script could not be written,
    /// working directory unusable.
    #[error("failed to start script: {0}")]
    Spawn(String),

    /// The caller raised the cancellation token while work was in flight.
    #[error("cancelled")]
    Cancelled,

    /// An expert branch failed (HTTP error, stream error, task panic).
    #[error("expert call failed: {0}")]
    Expert(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Cancellation is an outcome, not a failure: callers use this to
    /// report "cancelled" separately from "ran and failed".
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Cancelled)
    }

    /// Wraps a failure from the file-backed stores (project files, answer
    /// store), keeping its context chain in the message. A `ToolError`
    /// raised inside the store keeps its own kind.
    pub fn storage(err: anyhow::Error) -> Self {
        match err.downcast::<ToolError>() {
            Ok(err) => err,
            Err(err) => ToolError::Io(std::io::Error::other(format!("{err:#}"))),
        }
    }
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;
