//! Error types for governor operations.

use thiserror::Error;

/// Errors produced by governor components.
///
/// Capacity waits never appear here: `CapacityLimiter::reserve` resolves them
/// by suspending the caller, not by failing.
#[derive(Debug, Clone, Error)]
pub enum GovernorError {
    /// The task registry is at its ceiling even after a cleanup pass.
    #[error("task limit reached; retry later")]
    TaskLimitReached,
    /// A task exhausted its retry budget and is permanently failed.
    #[error("task {id} failed permanently after {attempts} attempts")]
    RetriesExhausted {
        /// Identifier of the dead task.
        id: String,
        /// Attempts made, including the first.
        attempts: u32,
    },
    /// A unit of work did not finish within its profile timeout.
    #[error("sandbox timed out after {elapsed_ms}ms")]
    SandboxTimeout {
        /// Milliseconds elapsed when the race was lost.
        elapsed_ms: u64,
    },
    /// The offline simulation's analogue of an out-of-memory condition.
    #[error("simulated resource exhaustion: {requested_mb}MB requested, {limit_mb}MB limit")]
    ResourceExhausted {
        /// Megabytes the workload tried to claim.
        requested_mb: u64,
        /// Profile memory ceiling.
        limit_mb: u64,
    },
    /// A live sandbox/service integration failed; simulation takes over.
    #[error("sandbox backend unavailable: {0}")]
    BackendUnavailable(String),
    /// The caller's own wait bound expired before the task settled.
    #[error("wait timed out after {waited_ms}ms")]
    WaitTimeout {
        /// Milliseconds the caller waited.
        waited_ms: u64,
    },
    /// Unknown task identifier.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The component has been shut down.
    #[error("governor is shut down")]
    Shutdown,
    /// Opaque work-function failure, retryable by the scheduler.
    #[error("work failed: {0}")]
    WorkFailed(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
