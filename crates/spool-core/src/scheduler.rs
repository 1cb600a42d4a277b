//! Scheduler: one coordinating loop plus a bounded pool of workers.
//!
//! Design:
//! - The loop owns admission. It walks jobs in registration order and, inside a job,
//!   ready tasks in insertion order, starting tasks while worker slots are free.
//! - Each started task runs on its own tokio task. Completions and progress reports
//!   come back over channels, so the loop is the only place that commits results.
//! - The loop sleeps until something changes (store notification, completion, report,
//!   shutdown). It never polls on a timer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::domain::{Job, JobId, LogLevel, TaskId};
use crate::error::{EngineError, ExecutionError};
use crate::executor::{Executor, ExecutorRegistry, ProgressReporter, Report, TaskContext};
use crate::store::{Gate, JobStore};

/// Extra time past the grace period that shutdown waits for the last completions.
const SHUTDOWN_SLACK: Duration = Duration::from_millis(500);

type Slot = (JobId, TaskId);

/// A task that was started and the executor that will run it.
struct Launch {
    ctx: TaskContext,
    executor: Arc<dyn Executor>,
}

/// How a worker ended.
#[derive(Debug)]
enum Outcome {
    Finished(Result<serde_json::Value, ExecutionError>),
    Panicked(String),
    /// Cancellation was requested and the executor did not return within the grace period.
    Orphaned,
}

impl Outcome {
    fn from_join(joined: Result<Result<serde_json::Value, ExecutionError>, JoinError>) -> Self {
        match joined {
            Ok(result) => Outcome::Finished(result),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Outcome::Panicked(message)
            }
            Err(_) => Outcome::Finished(Err(ExecutionError::Cancelled)),
        }
    }
}

#[derive(Debug)]
struct Completion {
    job_id: JobId,
    task_id: TaskId,
    outcome: Outcome,
}

pub struct Scheduler {
    store: Arc<JobStore>,
    executors: Arc<ExecutorRegistry>,
    config: SchedulerConfig,
}

/// Handle to a spawned scheduler.
/// - `request_shutdown()` asks the loop to stop admitting and abort what is running
/// - `shutdown_and_join()` also waits until every job state is final on disk
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "scheduler loop ended abnormally");
        }
    }
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>, executors: Arc<ExecutorRegistry>, config: SchedulerConfig) -> Self {
        Self {
            store,
            executors,
            config,
        }
    }

    /// Run the loop on the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        SchedulerHandle { shutdown, join }
    }

    /// Schedule until `shutdown` fires, then abort everything still in flight.
    pub async fn run(self, shutdown: CancellationToken) {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<Report>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut running: HashSet<Slot> = HashSet::new();

        tracing::info!(
            workers = self.config.worker_slots(),
            kinds = ?self.executors.kinds(),
            "scheduler started"
        );

        loop {
            self.admit(&mut running, &report_tx, &done_tx).await;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                // reports first: a worker sends its last report before its completion
                Some(report) = report_rx.recv() => self.apply_report(report).await,
                Some(done) = done_rx.recv() => {
                    running.remove(&(done.job_id, done.task_id));
                    self.finish(done).await;
                }
                _ = self.store.changed().notified() => {}
            }
        }

        self.shutdown(running, done_rx, report_rx).await;
        tracing::info!("scheduler stopped");
    }

    /// Start as many ready tasks as there are free slots.
    async fn admit(
        &self,
        running: &mut HashSet<Slot>,
        reports: &mpsc::UnboundedSender<Report>,
        done: &mpsc::UnboundedSender<Completion>,
    ) {
        for (job_id, shared) in self.store.jobs_in_order().await {
            let deps = {
                let job = shared.lock().await;
                if job.is_settled() {
                    continue;
                }
                job.job_dependencies().to_vec()
            };
            // resolved without holding this job's lock
            let gate = self.store.resolve_job_dependencies(&deps).await;
            let free = self.config.worker_slots().saturating_sub(running.len());

            let launches = self
                .store
                .update(job_id, |job| Ok(self.prepare(job, gate, free, reports)))
                .await;
            match launches {
                Ok(launches) => {
                    for launch in launches {
                        running.insert((job_id, launch.ctx.task_id));
                        spawn_worker(launch, self.config.grace_period(), done.clone());
                    }
                }
                Err(e) => tracing::debug!(job_id = %job_id, error = %e, "job vanished during admission"),
            }
        }
    }

    /// Pick up to `free` ready tasks and start each one.
    ///
    /// A job is only begun once it can actually run something, so a job queued behind
    /// busy workers or unfinished prerequisites stays `Init` and survives a restart as is.
    fn prepare(
        &self,
        job: &mut Job,
        gate: Gate,
        free: usize,
        reports: &mpsc::UnboundedSender<Report>,
    ) -> Vec<Launch> {
        match gate {
            Gate::Open => {}
            Gate::Closed => return Vec::new(),
            Gate::Broken(reason) => {
                job.begin();
                let failed = job.fail_unfinished(&reason);
                tracing::warn!(job_id = %job.id(), failed, reason = %reason, "prerequisite job failed");
                return Vec::new();
            }
        }
        if free == 0 && !job.is_started() {
            return Vec::new();
        }
        job.begin();

        let mut launches = Vec::new();
        for task_id in job.ready_tasks() {
            if launches.len() >= free {
                break;
            }
            let Some(task) = job.task(task_id) else {
                continue;
            };
            let name = task.name().to_string();
            let kind = task.kind().to_string();
            let params = task.params().clone();

            let Some(executor) = self.executors.get(&kind) else {
                let err = EngineError::ExecutorNotFound(kind);
                tracing::error!(job_id = %job.id(), task_id = %task_id, error = %err, "cannot start task");
                let _ = job.fail_task(task_id, err.to_string());
                continue;
            };
            if let Err(e) = job.start_task(task_id) {
                tracing::error!(job_id = %job.id(), task_id = %task_id, error = %e, "cannot start task");
                let _ = job.fail_task(task_id, e.to_string());
                continue;
            }

            let cancel = CancellationToken::new();
            job.set_cancel_token(task_id, cancel.clone());
            tracing::info!(job_id = %job.id(), task_id = %task_id, task = %name, kind = %kind, "task started");

            launches.push(Launch {
                ctx: TaskContext {
                    job_id: job.id(),
                    task_id,
                    name,
                    kind,
                    params,
                    work_dir: job.work_dir().to_path_buf(),
                    inputs: job.dependency_results(task_id),
                    cancel,
                    reporter: ProgressReporter::new(job.id(), task_id, reports.clone()),
                },
                executor,
            });
        }
        launches
    }

    /// Commit a worker's result.
    async fn finish(&self, done: Completion) {
        let Completion {
            job_id,
            task_id,
            outcome,
        } = done;

        let applied = self
            .store
            .update(job_id, |job| {
                let cancel_requested = job
                    .task(task_id)
                    .ok_or(EngineError::TaskNotFound(task_id))?
                    .is_cancel_requested();
                let applied = match outcome {
                    Outcome::Finished(Ok(result)) => job.complete_task(task_id, result),
                    Outcome::Finished(Err(ExecutionError::Cancelled)) => {
                        job.acknowledge_abort(task_id, "stopped after cancellation")
                    }
                    Outcome::Finished(Err(e)) if cancel_requested => {
                        job.acknowledge_abort(task_id, &format!("stopped after cancellation: {e}"))
                    }
                    Outcome::Finished(Err(e)) => job.fail_task(task_id, e.to_string()),
                    Outcome::Panicked(message) => job.fail_task(task_id, format!("executor panicked: {message}")),
                    Outcome::Orphaned => {
                        job.log(task_id, LogLevel::Warning, "work did not stop within the grace period; orphaned")?;
                        job.acknowledge_abort(task_id, "force-aborted")
                    }
                };
                applied?;
                Ok(job.task(task_id).map(|t| t.status()))
            })
            .await;

        match applied {
            Ok(status) => {
                tracing::info!(job_id = %job_id, task_id = %task_id, status = ?status, "task finished");
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(job_id = %job_id, task_id = %task_id, "discarding completion for deleted job");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, task_id = %task_id, error = %e, "completion not applied");
            }
        }
    }

    async fn apply_report(&self, report: Report) {
        let (job_id, task_id) = match &report {
            Report::Progress { job_id, task_id, .. } | Report::Log { job_id, task_id, .. } => (*job_id, *task_id),
        };
        let applied = self
            .store
            .update(job_id, |job| match report {
                Report::Progress { fraction, message, .. } => {
                    job.update_progress(task_id, fraction, message.as_deref()).map(|_| ())
                }
                Report::Log { level, message, .. } => job.log(task_id, level, message),
            })
            .await;
        if let Err(e) = applied {
            tracing::debug!(job_id = %job_id, task_id = %task_id, error = %e, "report dropped");
        }
    }

    /// Abort every started job, give workers the grace period to wind down, then
    /// force-abort whatever is left so nothing stays `Running` on disk.
    async fn shutdown(
        &self,
        mut running: HashSet<Slot>,
        mut done_rx: mpsc::UnboundedReceiver<Completion>,
        mut report_rx: mpsc::UnboundedReceiver<Report>,
    ) {
        tracing::info!(running = running.len(), "scheduler shutting down");
        for (job_id, shared) in self.store.jobs_in_order().await {
            let active = {
                let job = shared.lock().await;
                job.is_started() && !job.is_settled()
            };
            if active && let Err(e) = self.store.abort(job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "abort at shutdown failed");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.grace_period() + SHUTDOWN_SLACK;
        while !running.is_empty() {
            tokio::select! {
                biased;
                Some(report) = report_rx.recv() => self.apply_report(report).await,
                Some(done) = done_rx.recv() => {
                    running.remove(&(done.job_id, done.task_id));
                    self.finish(done).await;
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        for (job_id, task_id) in running {
            tracing::warn!(job_id = %job_id, task_id = %task_id, "worker still running at shutdown; forcing abort");
            let _ = self
                .store
                .update(job_id, |job| job.acknowledge_abort(task_id, "engine shut down"))
                .await;
        }
    }
}

/// Run one task. Cancellation gets `grace` to take effect before the work is dropped.
fn spawn_worker(launch: Launch, grace: Duration, done: mpsc::UnboundedSender<Completion>) {
    let Launch { ctx, executor } = launch;
    let job_id = ctx.job_id;
    let task_id = ctx.task_id;
    let cancel = ctx.cancel.clone();

    tokio::spawn(async move {
        let mut work = tokio::spawn(async move { executor.run(ctx).await });

        let outcome = tokio::select! {
            joined = &mut work => Outcome::from_join(joined),
            _ = cancel.cancelled() => match tokio::time::timeout(grace, &mut work).await {
                Ok(joined) => Outcome::from_join(joined),
                Err(_) => {
                    work.abort();
                    tracing::warn!(job_id = %job_id, task_id = %task_id, grace_ms = grace.as_millis() as u64, "executor ignored cancellation");
                    Outcome::Orphaned
                }
            },
        };

        // the loop is gone only during teardown; nothing left to report to
        let _ = done.send(Completion {
            job_id,
            task_id,
            outcome,
        });
    });
}
