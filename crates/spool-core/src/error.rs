use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{JobId, Status, TaskId};

/// Errors returned synchronously by engine operations.
///
/// Structural misuse (`InvalidTransition`, `CyclicDependency`, `JobAlreadyStarted`,
/// not-found, `DuplicateId`) is returned to the caller. Executor failures are captured
/// into the failing task instead and only show up here when a caller asks for them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("adding {task} would create a dependency cycle")]
    CyclicDependency { task: TaskId },

    #[error("{0} has already started; its task graph is frozen")]
    JobAlreadyStarted(JobId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("{job} is required by {} active job(s)", .dependents.len())]
    HasDependents { job: JobId, dependents: Vec<JobId> },

    #[error("no executor registered for kind={0}")]
    ExecutorNotFound(String),

    #[error("duplicate executor for kind={0}")]
    DuplicateExecutor(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl EngineError {
    /// True for both flavours of not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::JobNotFound(_) | EngineError::TaskNotFound(_))
    }
}

/// Failure reported by an executor. Becomes the task's `Error` (or `Aborted`) state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionError::Failed(message.into())
    }
}

/// Snapshot or log file could not be read or written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed data at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported schema version {found} at {path} (supported: <= {supported})")]
    UnsupportedSchema {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("job has no working directory; register it first")]
    NotRegistered,
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serde(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        PersistenceError::Serde {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
