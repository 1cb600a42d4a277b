//! Job aggregate: an ordered set of tasks, their dependency graph, and derived status.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::events::{EventKind, JobEvent};
use super::graph::DependencyGraph;
use super::ids::{JobId, TaskId};
use super::log::LogLevel;
use super::status::{Status, derive_job_status};
use super::task::Task;
use crate::error::{EngineError, Result};
use crate::persist;

/// A job record.
///
/// Design: Following the same pattern as `Task`.
/// - Single source of truth for its tasks. They are only mutated through the job, so
///   every change is turned into a `JobEvent` and cascades are applied in one place.
/// - Status is never stored. `status()` derives it from the tasks on every call.
/// - Other jobs are referenced by ID only and resolved through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    depends_on_jobs: Vec<JobId>,
    tasks: Vec<Task>,

    #[serde(skip)]
    work_dir: PathBuf,
    #[serde(skip)]
    index: HashMap<TaskId, usize>,
    #[serde(skip)]
    graph: DependencyGraph,
    #[serde(skip)]
    events: Vec<JobEvent>,
    #[serde(skip)]
    cancel_tokens: HashMap<TaskId, CancellationToken>,
}

impl Job {
    /// New, unregistered job. It gets its ID and working directory from `JobStore::register`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobId::nil(),
            name: name.into(),
            created_at: Utc::now(),
            started_at: None,
            depends_on_jobs: Vec::new(),
            tasks: Vec::new(),
            work_dir: PathBuf::new(),
            index: HashMap::new(),
            graph: DependencyGraph::new(),
            events: Vec::new(),
            cancel_tokens: HashMap::new(),
        }
    }

    /// Builder form of `add_job_dependency`.
    pub fn depends_on_job(mut self, job: JobId) -> Self {
        if !self.depends_on_jobs.contains(&job) {
            self.depends_on_jobs.push(job);
        }
        self
    }

    pub fn add_job_dependency(&mut self, job: JobId) -> Result<()> {
        self.ensure_not_started()?;
        if !self.depends_on_jobs.contains(&job) {
            self.depends_on_jobs.push(job);
        }
        Ok(())
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn is_registered(&self) -> bool {
        !self.id.is_nil()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn job_dependencies(&self) -> &[JobId] {
        &self.depends_on_jobs
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.index.get(&id).map(|&i| &self.tasks[i])
    }

    /// Derived on demand; never cached.
    pub fn status(&self) -> Status {
        derive_job_status(self.tasks.iter().map(Task::status))
    }

    /// Every task has reached a terminal status.
    pub fn is_settled(&self) -> bool {
        self.tasks.iter().all(|t| t.status().is_terminal())
    }

    /// Mean progress over all tasks.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        self.tasks.iter().map(Task::progress).sum::<f64>() / self.tasks.len() as f64
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.is_started() {
            return Err(EngineError::JobAlreadyStarted(self.id));
        }
        Ok(())
    }

    /// Add a task together with the dependencies it declares.
    ///
    /// Dependencies may name tasks that are added later. The graph is left untouched when
    /// the new edges would close a cycle.
    pub fn add_task(&mut self, task: Task) -> Result<TaskId> {
        self.ensure_not_started()?;
        let id = task.id();
        if self.index.contains_key(&id) {
            return Err(EngineError::DuplicateId(id.to_string()));
        }
        if self.graph.would_close_cycle(id, task.dependencies()) {
            return Err(EngineError::CyclicDependency { task: id });
        }
        for &dep in task.dependencies() {
            self.graph.add_dependency(id, dep);
        }
        self.index.insert(id, self.tasks.len());
        self.tasks.push(task);
        Ok(id)
    }

    /// First declared dependency that never resolved to a task of this job.
    pub fn dangling_dependency(&self) -> Option<TaskId> {
        self.tasks
            .iter()
            .flat_map(|t| t.dependencies().iter().copied())
            .find(|dep| !self.index.contains_key(dep))
    }

    fn deps_done(&self, task: &Task) -> bool {
        task.dependencies()
            .iter()
            .all(|dep| self.task(*dep).is_some_and(|d| d.status() == Status::Done))
    }

    /// Pending tasks whose every dependency is `Done`, in insertion order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status().is_pending() && self.deps_done(t))
            .map(Task::id)
            .collect()
    }

    /// Results of the direct dependencies of `id`.
    pub fn dependency_results(&self, id: TaskId) -> Vec<(TaskId, serde_json::Value)> {
        self.task(id)
            .map(|task| {
                task.dependencies()
                    .iter()
                    .filter_map(|dep| {
                        self.task(*dep)
                            .and_then(|d| d.result().cloned())
                            .map(|r| (*dep, r))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // mutations (every one of them goes through `with_task`)
    // ------------------------------------------------------------------

    fn emit(&mut self, task_id: TaskId, kind: EventKind) {
        self.events.push(JobEvent {
            job_id: self.id,
            task_id,
            kind,
        });
    }

    /// Run `f` against one task and turn whatever changed into events.
    fn with_task<R>(&mut self, id: TaskId, f: impl FnOnce(&mut Task) -> Result<R>) -> Result<R> {
        let idx = *self.index.get(&id).ok_or(EngineError::TaskNotFound(id))?;
        let task = &mut self.tasks[idx];
        let (status, progress, log_len) = (task.status, task.progress, task.log.len());

        let out = f(task);

        let task = &self.tasks[idx];
        let mut kinds: Vec<EventKind> = task.log[log_len..]
            .iter()
            .map(|e| EventKind::Log {
                level: e.level,
                message: e.message.clone(),
            })
            .collect();
        if task.progress != progress {
            kinds.push(EventKind::Progress {
                fraction: task.progress,
            });
        }
        if task.status != status {
            kinds.push(EventKind::Status {
                from: status,
                to: task.status,
            });
        }
        for kind in kinds {
            self.emit(id, kind);
        }
        out
    }

    /// Mark the job as started: its graph is frozen and `Init` tasks become `Waiting`.
    pub fn begin(&mut self) {
        if self.is_started() {
            return;
        }
        self.started_at = Some(Utc::now());
        let pending: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status() == Status::Init)
            .map(Task::id)
            .collect();
        for id in pending {
            let _ = self.with_task(id, |t| t.wait());
        }
    }

    /// Start one task. Fails with `InvalidTransition` unless it is pending and every
    /// dependency is `Done`.
    pub fn start_task(&mut self, id: TaskId) -> Result<()> {
        let task = self.task(id).ok_or(EngineError::TaskNotFound(id))?;
        if !self.deps_done(task) {
            return Err(EngineError::InvalidTransition {
                from: task.status(),
                to: Status::Running,
            });
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.with_task(id, |t| t.start()).map(|_| ())
    }

    /// Remember how to signal the work behind a running task.
    pub(crate) fn set_cancel_token(&mut self, id: TaskId, token: CancellationToken) {
        self.cancel_tokens.insert(id, token);
    }

    pub fn update_progress(&mut self, id: TaskId, fraction: f64, message: Option<&str>) -> Result<f64> {
        self.with_task(id, |t| {
            if let Some(message) = message {
                t.push_log(LogLevel::Info, message);
            }
            Ok(t.update_progress(fraction))
        })
    }

    /// Append a log line. Ignored once the task is terminal.
    pub fn log(&mut self, id: TaskId, level: LogLevel, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.with_task(id, |t| {
            t.push_log(level, message);
            Ok(())
        })
    }

    pub fn complete_task(&mut self, id: TaskId, result: serde_json::Value) -> Result<()> {
        self.with_task(id, |t| t.complete(result))?;
        self.cancel_tokens.remove(&id);
        Ok(())
    }

    /// Fail a task and cascade `Error` to everything downstream of it.
    /// Siblings without a dependency on it keep going.
    pub fn fail_task(&mut self, id: TaskId, error: impl Into<String>) -> Result<()> {
        self.with_task(id, |t| t.fail(error))?;
        self.cancel_tokens.remove(&id);
        self.cascade_failure(id);
        Ok(())
    }

    /// Request cancellation of one task.
    ///
    /// A task that has not started is aborted right away. A running task gets its
    /// cancellation token fired and stays `Running` until the worker acknowledges.
    pub fn cancel_task(&mut self, id: TaskId) -> Result<()> {
        let aborted = self.with_task(id, |t| Ok(t.cancel()))?;
        if aborted.is_some() {
            self.cascade_failure(id);
        } else if let Some(token) = self.cancel_tokens.get(&id) {
            token.cancel();
        }
        Ok(())
    }

    /// Running -> Aborted, after the work acknowledged cancellation or the grace period ran out.
    pub fn acknowledge_abort(&mut self, id: TaskId, message: &str) -> Result<()> {
        self.with_task(id, |t| t.acknowledge_abort(message))?;
        self.cancel_tokens.remove(&id);
        self.cascade_failure(id);
        Ok(())
    }

    /// Cancel every non-terminal task. Idempotent.
    ///
    /// Pending tasks are all aborted before any cascade runs, so a chain of pending
    /// tasks ends `Aborted` rather than `Error`.
    pub fn abort(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        let open: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| !t.status().is_terminal())
            .map(Task::id)
            .collect();
        let mut aborted = Vec::new();
        for id in open {
            match self.with_task(id, |t| Ok(t.cancel())) {
                Ok(Some(_)) => aborted.push(id),
                Ok(None) => {
                    if let Some(token) = self.cancel_tokens.get(&id) {
                        token.cancel();
                    }
                }
                // every id comes from `self.tasks`
                Err(_) => {}
            }
        }
        for id in aborted {
            self.cascade_failure(id);
        }
    }

    /// Fail every unfinished task, running ones included. Returns how many changed.
    pub fn fail_unfinished(&mut self, reason: &str) -> usize {
        let open: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| !t.status().is_terminal())
            .map(Task::id)
            .collect();
        let mut changed = 0;
        for id in open {
            if self.with_task(id, |t| t.fail(reason)).is_ok() {
                changed += 1;
            }
            self.cancel_tokens.remove(&id);
        }
        changed
    }

    fn cascade_failure(&mut self, failed: TaskId) {
        let Some(origin) = self.task(failed) else {
            return;
        };
        let reason = format!(
            "dependency {} ({}) ended {}",
            origin.name(),
            failed,
            origin.status()
        );
        for id in self.graph.downstream(failed) {
            let open = self.task(id).is_some_and(|t| !t.status().is_terminal());
            if open {
                let _ = self.with_task(id, |t| t.fail(reason.clone()));
                self.cancel_tokens.remove(&id);
            }
        }
    }

    /// Hand over everything that happened since the last call.
    pub fn drain_events(&mut self) -> Vec<JobEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // registration and persistence
    // ------------------------------------------------------------------

    pub(crate) fn assign(&mut self, id: JobId, work_dir: PathBuf) {
        self.id = id;
        self.work_dir = work_dir;
        // nothing observed the job before it had an ID
        self.events.clear();
    }

    /// Rebuild the in-memory index and graph after deserialization.
    fn rebuild(&mut self) -> Result<()> {
        let tasks = std::mem::take(&mut self.tasks);
        self.index.clear();
        self.graph = DependencyGraph::new();
        for task in tasks {
            let id = task.id();
            if self.index.contains_key(&id) {
                return Err(EngineError::DuplicateId(id.to_string()));
            }
            if self.graph.would_close_cycle(id, task.dependencies()) {
                return Err(EngineError::CyclicDependency { task: id });
            }
            for &dep in task.dependencies() {
                self.graph.add_dependency(id, dep);
            }
            self.index.insert(id, self.tasks.len());
            self.tasks.push(task);
        }
        Ok(())
    }

    /// Append unflushed log lines, then atomically replace the snapshot.
    pub fn save(&mut self) -> Result<()> {
        if !self.is_registered() || self.work_dir.as_os_str().is_empty() {
            return Err(crate::error::PersistenceError::NotRegistered.into());
        }
        self.flush_logs()?;
        persist::write_snapshot(&self.work_dir, self)?;
        Ok(())
    }

    /// Append unflushed log lines only.
    pub fn flush_logs(&mut self) -> Result<()> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(crate::error::PersistenceError::NotRegistered.into());
        }
        for task in &mut self.tasks {
            let pending = task.unflushed_log();
            if pending.is_empty() {
                continue;
            }
            persist::append_log(&self.work_dir, task.id(), pending)?;
            task.log_flushed = task.log.len();
        }
        Ok(())
    }

    /// Load a job from its working directory, logs included.
    pub fn load(dir: &Path) -> Result<Job> {
        let mut job = persist::read_snapshot(dir)?;
        job.work_dir = dir.to_path_buf();
        for task in &mut job.tasks {
            task.log = persist::read_log(dir, task.id())?;
            task.log_flushed = task.log.len();
        }
        job.rebuild()?;
        Ok(job)
    }

    /// Fix up a job that had a task running when the process went away. The job's
    /// derived status may already be `Error` or `Aborted` at that point.
    /// Returns true when anything changed.
    pub fn recover_after_crash(&mut self) -> bool {
        if !self.tasks.iter().any(|t| t.status() == Status::Running) {
            return false;
        }
        self.fail_unfinished("interrupted by engine restart") > 0
    }
}
