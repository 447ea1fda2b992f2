use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    NotFound { id: String },

    /// No run record with the given ID exists in the store.
    #[error("Run not found: {id}")]
    RunNotFound { id: i64 },

    /// A task with this ID already exists.
    #[error("Task already exists: {id}")]
    Duplicate { id: String },

    /// No executor is registered for the task's kind.
    #[error("Unknown task kind: {kind}")]
    UnknownKind { kind: String },

    /// An executor for this kind was already registered.
    #[error("Executor already registered for kind: {kind}")]
    DuplicateKind { kind: String },

    /// The executor rejected the task parameters.
    #[error("Invalid parameters for {kind}: {reason}")]
    InvalidParameters { kind: String, reason: String },

    /// The schedule expression could not be parsed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Operation requires a running dispatcher.
    #[error("Dispatcher is not running")]
    NotRunning,

    /// `start` called on a dispatcher that is already running or draining.
    #[error("Dispatcher is already running")]
    AlreadyRunning,

    /// Underlying SQLite / rusqlite error.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Filesystem failure while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored parameters could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was cancelled before it produced a result.
    #[error("Run cancelled")]
    Cancelled,

    /// The executor reported a failure.
    #[error("Executor failure: {0}")]
    ExecutorFailure(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
