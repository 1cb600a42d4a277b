//! Domain model: IDs, statuses, tasks, jobs and the events they emit.

pub mod events;
pub mod graph;
pub mod ids;
pub mod job;
pub mod log;
pub mod status;
pub mod task;

pub use events::{EventKind, JobEvent};
pub use graph::DependencyGraph;
pub use ids::{JobId, ParseIdError, TaskId};
pub use job::Job;
pub use log::{LogEntry, LogLevel};
pub use status::{ParseStatusError, Status, derive_job_status};
pub use task::Task;
