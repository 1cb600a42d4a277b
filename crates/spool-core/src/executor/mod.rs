//! Executor contract: the work behind a task.
//!
//! The engine never looks inside an executor. It hands over a `TaskContext`
//! (params, working directory, dependency results, cancellation token, progress
//! reporter) and gets back a JSON result or an `ExecutionError`.

pub mod command;
pub mod typed;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{JobId, LogLevel, TaskId};
use crate::error::{EngineError, ExecutionError, Result};

pub use self::command::{CommandExecutor, CommandParams};
pub use self::typed::{Handler, TaskParams, TypedExecutor};

/// The capability every task kind implements.
///
/// Implementations must poll `ctx.is_cancelled()` (or await `ctx.cancelled()`) and stop
/// with `ExecutionError::Cancelled` when asked to.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> std::result::Result<serde_json::Value, ExecutionError>;
}

/// Messages from running executors back to the scheduler loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Report {
    Progress {
        job_id: JobId,
        task_id: TaskId,
        fraction: f64,
        message: Option<String>,
    },
    Log {
        job_id: JobId,
        task_id: TaskId,
        level: LogLevel,
        message: String,
    },
}

/// Cheap, clonable handle executors use to report progress and log lines.
///
/// Reporting never blocks and never fails; reports sent after the scheduler
/// went away are dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    task_id: TaskId,
    tx: mpsc::UnboundedSender<Report>,
}

impl ProgressReporter {
    pub(crate) fn new(job_id: JobId, task_id: TaskId, tx: mpsc::UnboundedSender<Report>) -> Self {
        Self {
            job_id,
            task_id,
            tx,
        }
    }

    pub fn progress(&self, fraction: f64, message: Option<String>) {
        let _ = self.tx.send(Report::Progress {
            job_id: self.job_id,
            task_id: self.task_id,
            fraction,
            message,
        });
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.tx.send(Report::Log {
            job_id: self.job_id,
            task_id: self.task_id,
            level,
            message: message.into(),
        });
    }
}

/// Everything an executor gets to see about the task it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub(crate) job_id: JobId,
    pub(crate) task_id: TaskId,
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) params: serde_json::Value,
    pub(crate) work_dir: PathBuf,
    pub(crate) inputs: Vec<(TaskId, serde_json::Value)>,
    pub(crate) cancel: CancellationToken,
    pub(crate) reporter: ProgressReporter,
}

impl TaskContext {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
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

    /// The owning job's working directory; task outputs belong here.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Results of this task's dependencies, in declaration order.
    pub fn inputs(&self) -> &[(TaskId, serde_json::Value)] {
        &self.inputs
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(Cancelled)` once cancellation is requested. Handy between steps: `ctx.checkpoint()?;`
    pub fn checkpoint(&self) -> std::result::Result<(), ExecutionError> {
        if self.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn report_progress(&self, fraction: f64, message: Option<String>) {
        self.reporter.progress(fraction, message);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.reporter.log(level, message);
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }
}

/// Registry of executors (kind -> executor).
///
/// Design:
/// - Built during initialization (mutable).
/// - Shared by the scheduler afterwards (immutable, behind an `Arc`).
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, executor: Arc<dyn Executor>) -> Result<()> {
        let kind = kind.into();
        if self.executors.contains_key(&kind) {
            return Err(EngineError::DuplicateExecutor(kind));
        }
        self.executors.insert(kind, executor);
        Ok(())
    }

    /// Register a typed handler under `P::KIND`.
    pub fn register_typed<P, H>(&mut self, handler: H) -> Result<()>
    where
        P: TaskParams,
        H: Handler<P> + 'static,
    {
        self.register(P::KIND, Arc::new(TypedExecutor::<P, H>::new(handler)))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A context wired to a channel the test can read from.
    pub(crate) fn context(params: serde_json::Value) -> (TaskContext, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let job_id = JobId::generate();
        let task_id = TaskId::generate();
        let ctx = TaskContext {
            job_id,
            task_id,
            name: "test".to_string(),
            kind: "test".to_string(),
            params,
            work_dir: std::env::temp_dir(),
            inputs: Vec::new(),
            cancel: CancellationToken::new(),
            reporter: ProgressReporter::new(job_id, task_id, tx),
        };
        (ctx, rx)
    }
}
