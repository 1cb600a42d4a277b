//! Events emitted by task mutations.
//!
//! The job collects these while it is mutated; the store drains them to decide
//! whether to persist and then fans them out to subscribers.

use serde::{Deserialize, Serialize};

use super::ids::{JobId, TaskId};
use super::log::LogLevel;
use super::status::Status;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Status { from: Status, to: Status },
    Progress { fraction: f64 },
    Log { level: LogLevel, message: String },
}

impl JobEvent {
    /// Status changes must reach disk before anyone observes them.
    pub fn affects_status(&self) -> bool {
        matches!(self.kind, EventKind::Status { .. })
    }
}
