//! Task record: the smallest schedulable unit of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::log::{LogEntry, LogLevel};
use super::status::Status;
use crate::error::{EngineError, Result};

/// A task and everything observed about it.
///
/// Design:
/// - Single source of truth for one task's state. Transitions happen through methods.
/// - `kind` selects the executor at start time; `params` is handed to it untouched.
/// - The log is not part of the snapshot. It lives in its own append-only file and
///   `log_flushed` tracks how much of it already reached disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) params: serde_json::Value,
    #[serde(default)]
    pub(crate) depends_on: Vec<TaskId>,
    pub(crate) status: Status,
    #[serde(default)]
    pub(crate) progress: f64,
    #[serde(default)]
    pub(crate) result: Option<serde_json::Value>,
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) cancel_requested: bool,
    pub(crate) created_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(crate) finished_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub(crate) log: Vec<LogEntry>,
    #[serde(skip)]
    pub(crate) log_flushed: usize,
}

impl Task {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            name: name.into(),
            kind: kind.into(),
            params: serde_json::Value::Null,
            depends_on: Vec::new(),
            status: Status::Init,
            progress: 0.0,
            result: None,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            log: Vec::new(),
            log_flushed: 0,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Declare a dependency. Order is kept; duplicates are ignored.
    pub fn depends_on(mut self, task: TaskId) -> Self {
        if !self.depends_on.contains(&task) {
            self.depends_on.push(task);
        }
        self
    }

    pub fn depends_on_all(self, tasks: impl IntoIterator<Item = TaskId>) -> Self {
        tasks.into_iter().fold(self, Task::depends_on)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.depends_on
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn transition(&mut self, to: Status) -> Result<Status> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(from)
    }

    /// Init -> Waiting. Returns the previous status.
    pub(crate) fn wait(&mut self) -> Result<Status> {
        self.transition(Status::Waiting)
    }

    /// Init | Waiting -> Running. Dependencies are checked by the owning job.
    pub fn start(&mut self) -> Result<Status> {
        let from = self.transition(Status::Running)?;
        self.started_at = Some(Utc::now());
        self.push_log(LogLevel::Info, "started");
        Ok(from)
    }

    /// Request cooperative termination.
    ///
    /// Returns `Some(previous)` when the task became `Aborted` right away (it never started),
    /// `None` when it is running and must acknowledge first, or is already terminal.
    pub fn cancel(&mut self) -> Option<Status> {
        if self.status.is_terminal() {
            return None;
        }
        self.cancel_requested = true;
        if self.status == Status::Running {
            self.push_log(LogLevel::Warning, "cancellation requested");
            return None;
        }
        self.push_log(LogLevel::Warning, "aborted before start");
        self.transition(Status::Aborted).ok()
    }

    /// Running -> Aborted once the work acknowledged (or ignored) cancellation.
    pub(crate) fn acknowledge_abort(&mut self, message: &str) -> Result<Status> {
        self.push_log(LogLevel::Warning, message);
        self.transition(Status::Aborted)
    }

    /// Clamp into [0, 1] and never go backwards. Returns the stored fraction.
    pub fn update_progress(&mut self, fraction: f64) -> f64 {
        if self.status.is_terminal() || !fraction.is_finite() {
            return self.progress;
        }
        self.progress = self.progress.max(fraction.clamp(0.0, 1.0));
        self.progress
    }

    pub fn complete(&mut self, result: serde_json::Value) -> Result<Status> {
        let from = self.transition(Status::Done)?;
        self.progress = 1.0;
        self.result = Some(result);
        // pushed after the transition would be dropped; write the closing line directly
        self.log.push(LogEntry::new(LogLevel::Info, "done"));
        Ok(from)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<Status> {
        let error = error.into();
        let from = self.transition(Status::Error)?;
        self.log.push(LogEntry::new(LogLevel::Error, error.clone()));
        self.error = Some(error);
        Ok(from)
    }

    /// Append to the log unless the task is terminal (the log is frozen then).
    pub(crate) fn push_log(&mut self, level: LogLevel, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.log.push(LogEntry::new(level, message));
        true
    }

    /// Entries not yet written to the log file.
    pub(crate) fn unflushed_log(&self) -> &[LogEntry] {
        &self.log[self.log_flushed.min(self.log.len())..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_task_starts_in_init() {
        let task = Task::new("prepare", "noop");
        assert_eq!(task.status(), Status::Init);
        assert_eq!(task.progress(), 0.0);
        assert!(task.result().is_none());
    }

    #[test]
    fn dependencies_keep_order_and_drop_duplicates() {
        let a = TaskId::from_u128(1);
        let b = TaskId::from_u128(2);
        let task = Task::new("c", "noop").depends_on_all([b, a, b]);
        assert_eq!(task.dependencies(), &[b, a]);
    }

    #[test]
    fn start_then_complete() {
        let mut task = Task::new("t", "noop");
        task.start().unwrap();
        assert_eq!(task.status(), Status::Running);
        assert!(task.started_at().is_some());

        task.complete(json!({"rows": 3})).unwrap();
        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.progress(), 1.0);
        assert_eq!(task.result(), Some(&json!({"rows": 3})));
        assert!(task.finished_at().is_some());
    }

    #[test]
    fn start_twice_is_invalid() {
        let mut task = Task::new("t", "noop");
        task.start().unwrap();
        let err = task.start().unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: Status::Running,
                to: Status::Running
            }
        ));
    }

    #[test]
    fn complete_without_start_is_invalid() {
        let mut task = Task::new("t", "noop");
        assert!(task.complete(json!(null)).is_err());
        assert_eq!(task.status(), Status::Init);
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut task = Task::new("t", "noop");
        task.start().unwrap();
        assert_eq!(task.update_progress(0.4), 0.4);
        assert_eq!(task.update_progress(0.2), 0.4);
        assert_eq!(task.update_progress(7.0), 1.0);
        assert_eq!(task.update_progress(f64::NAN), 1.0);
    }

    #[test]
    fn cancel_before_start_aborts_immediately() {
        let mut task = Task::new("t", "noop");
        assert_eq!(task.cancel(), Some(Status::Init));
        assert_eq!(task.status(), Status::Aborted);
        // idempotent
        assert_eq!(task.cancel(), None);
    }

    #[test]
    fn cancel_while_running_waits_for_acknowledgement() {
        let mut task = Task::new("t", "noop");
        task.start().unwrap();
        assert_eq!(task.cancel(), None);
        assert_eq!(task.status(), Status::Running);
        assert!(task.is_cancel_requested());

        task.acknowledge_abort("stopped").unwrap();
        assert_eq!(task.status(), Status::Aborted);
    }

    #[test]
    fn log_is_frozen_after_terminal_state() {
        let mut task = Task::new("t", "noop");
        task.start().unwrap();
        assert!(task.push_log(LogLevel::Info, "working"));
        task.fail("boom").unwrap();
        let len = task.log().len();

        assert!(!task.push_log(LogLevel::Info, "late"));
        assert_eq!(task.log().len(), len);
        assert_eq!(task.log().last().unwrap().message, "boom");
        assert_eq!(task.error(), Some("boom"));
    }
}
