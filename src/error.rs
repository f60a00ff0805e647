//! Error taxonomy for the tool surface.
//!
//! Every variant is a value surfaced to the caller as `{"success": false,
//! "error": ...}` JSON; nothing here propagates as a crash. Failures in the
//! observability path (the store, the manopt harvester) are absorbed by
//! their call sites and never fail the command being executed.

use thiserror::Error;

/// Errors surfaced by tool handlers.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Bad arguments: missing command, wrong type, empty input.
    #[error("validation error: {0}")]
    Validation(String),

    /// NEVERHANG blocked the submission.
    #[error("{0}")]
    CircuitOpen(String),

    /// The shell could not be launched.
    #[error("failed to spawn shell: {0}")]
    SpawnFailure(String),

    /// Read/write failure on a pipe or PTY.
    #[error("i/o failure: {0}")]
    IoFailure(String),

    /// `send`/`kill` on a task that is not running.
    #[error("task '{0}' is not running")]
    NotRunning(String),

    /// `poll`/`send`/`kill` with an unknown task id.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// Store acquisition timed out; recording is dropped, execution continues.
    #[error("observation store unavailable: {0}")]
    StoreUnavailable(String),

    /// The transport aborted the call.
    #[error("cancelled")]
    Cancelled,

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ToolError {
    /// Stable machine-readable kind for JSON payloads and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::CircuitOpen(_) => "circuit_open",
            Self::SpawnFailure(_) => "spawn_failure",
            Self::IoFailure(_) => "io_failure",
            Self::NotRunning(_) => "not_running",
            Self::UnknownTask(_) => "unknown_task",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }
}
