//! spool-core
//!
//! Job execution engine: jobs made of dependent tasks, run by a bounded worker pool,
//! persisted to disk after every status change and recovered after a crash.
//!
//! # Modules
//! - **domain**: IDs, statuses, `Task`, `Job`, dependency graph, events
//! - **persist**: on-disk snapshot and log format
//! - **store**: `JobStore`, the registry of jobs
//! - **scheduler**: `Scheduler`, admission and worker pool
//! - **executor**: the `Executor` contract, typed handlers, subprocess executor
//! - **ports**: clock and ID generation seams
//! - **config** / **observability** / **error**: ambient plumbing

pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod observability;
pub mod persist;
pub mod ports;
pub mod scheduler;
pub mod store;

pub use config::{ConfigError, EngineConfig, LogFormat, LoggingConfig, SchedulerConfig};
pub use domain::{EventKind, Job, JobEvent, JobId, LogEntry, LogLevel, Status, Task, TaskId};
pub use error::{EngineError, ExecutionError, PersistenceError, Result};
pub use executor::{
    CommandExecutor, CommandParams, Executor, ExecutorRegistry, Handler, ProgressReporter, TaskContext,
    TaskParams,
};
pub use observability::{StatusCounts, init_tracing};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use store::{JobFilter, JobStore, LoadReport};
