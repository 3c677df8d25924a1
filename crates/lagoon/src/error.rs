//! Error types for the Lagoon pool.

use thiserror::Error;

/// Errors surfaced to task submitters and pool constructors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The submission named no task module and the pool has no default.
    #[error("no task module name provided and the pool has no default")]
    ModuleNotProvided,

    /// The task queue is bounded and full.
    #[error("task queue is at capacity")]
    QueueAtLimit,

    /// Queueing is disabled (`max_queue` of zero) and no worker can take the task.
    #[error("no task queue available and no worker is free")]
    NoQueueAvailable,

    /// The worker owning the task was torn down before the task finished.
    #[error("the owning worker thread was terminated")]
    ThreadTermination,

    /// The caller signalled cancellation.
    #[error("the task was aborted")]
    Aborted,

    /// The transfer list could not be shipped to the worker.
    #[error("invalid transfer list: {0}")]
    InvalidTransfer(String),

    /// The task module reported an error, forwarded verbatim.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// No task module is registered under the requested name.
    #[error("no task module registered under {0:?}")]
    ModuleNotFound(String),

    /// Pool construction was given inconsistent options.
    #[error("invalid pool options: {0}")]
    InvalidOptions(String),
}

/// A specialized Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
