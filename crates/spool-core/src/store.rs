//! JobStore: the process-wide registry of jobs.
//!
//! Locking:
//! - `registry` (RwLock) guards the index: register, delete and load_all take it for writing.
//! - every job sits behind its own `Mutex`. Holding it is what serializes that job's
//!   saves; different jobs are mutated and saved in parallel.
//! - lock order is registry -> job. Nothing takes the registry while holding a job.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, OwnedMutexGuard, RwLock, broadcast};

use crate::domain::{Job, JobEvent, JobId, Status, Task, TaskId};
use crate::error::{EngineError, PersistenceError, Result};
use crate::observability::StatusCounts;
use crate::persist;
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

pub type SharedJob = Arc<Mutex<Job>>;

/// Fresh IDs tried before `register` gives up with `DuplicateId`.
const MAX_ID_ATTEMPTS: usize = 8;

const EVENT_CAPACITY: usize = 1024;

struct Entry {
    /// Registration order; scheduling ties are broken by it.
    seq: u64,
    job: SharedJob,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl Registry {
    fn insert(&mut self, job: Job) -> SharedJob {
        let id = job.id();
        let shared = Arc::new(Mutex::new(job));
        self.jobs.insert(
            id,
            Entry {
                seq: self.next_seq,
                job: Arc::clone(&shared),
            },
        );
        self.next_seq += 1;
        shared
    }
}

/// Filter for `JobStore::list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<Status>,
    /// Case-insensitive substring of the job name.
    pub name_contains: Option<String>,
}

impl JobFilter {
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_name(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status
            && job.status() != status
        {
            return false;
        }
        if let Some(needle) = &self.name_contains
            && !job.name().to_lowercase().contains(&needle.to_lowercase())
        {
            return false;
        }
        true
    }
}

/// Outcome of `JobStore::load_all`.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Every job now in the registry, in registration order.
    pub restored: Vec<JobId>,
    /// Jobs that were running when the previous process died and are now `Error`.
    pub recovered: Vec<JobId>,
    /// Directories that could not be restored.
    pub failed: Vec<(PathBuf, EngineError)>,
}

/// Whether a job's prerequisite jobs allow its tasks to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Gate {
    Open,
    Closed,
    Broken(String),
}

pub struct JobStore {
    root: PathBuf,
    ids: Box<dyn IdGenerator>,
    registry: RwLock<Registry>,
    events: broadcast::Sender<JobEvent>,
    changed: Notify,
}

impl JobStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    /// Nothing is loaded yet; call `load_all` once before scheduling.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PersistenceError::io(&root, e))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            root,
            ids: Box::new(UlidGenerator::new(SystemClock)),
            registry: RwLock::new(Registry::default()),
            events,
            changed: Notify::new(),
        })
    }

    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Live feed of status, progress and log events for every job.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Woken whenever scheduling-relevant state changed.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Restore every persisted job under the root directory.
    ///
    /// Jobs that were running when the previous process stopped are marked `Error`:
    /// whatever was in flight cannot be trusted. Unreadable directories are reported
    /// and skipped so one bad snapshot does not keep the rest offline.
    pub async fn load_all(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let entries = fs::read_dir(&self.root).map_err(|e| PersistenceError::io(&self.root, e))?;

        let mut loaded = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    report
                        .failed
                        .push((self.root.clone(), PersistenceError::io(&self.root, e).into()));
                    continue;
                }
            };
            if !path.is_dir() || !persist::is_job_dir(&path) {
                continue;
            }
            match Job::load(&path) {
                Ok(job) => loaded.push(job),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "cannot restore job");
                    report.failed.push((path, e));
                }
            }
        }
        loaded.sort_by_key(|job| (job.created_at(), job.id()));

        let mut registry = self.registry.write().await;
        for mut job in loaded {
            let id = job.id();
            if id.is_nil() || registry.jobs.contains_key(&id) {
                let path = job.work_dir().to_path_buf();
                tracing::error!(path = %path.display(), job_id = %id, "duplicate job id on disk");
                report.failed.push((path, EngineError::DuplicateId(id.to_string())));
                continue;
            }
            if job.recover_after_crash() {
                tracing::warn!(job_id = %id, name = job.name(), "job was running at shutdown; marked as error");
                job.drain_events();
                if let Err(e) = job.save() {
                    tracing::error!(job_id = %id, error = %e, "cannot persist recovered job");
                }
                report.recovered.push(id);
            }
            registry.insert(job);
            report.restored.push(id);
        }
        drop(registry);

        tracing::info!(
            restored = report.restored.len(),
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            root = %self.root.display(),
            "jobs loaded"
        );
        self.changed.notify_one();
        Ok(report)
    }

    /// Register a job: assign a fresh ID, create its working directory, persist it.
    pub async fn register(&self, mut job: Job) -> Result<JobId> {
        if let Some(dep) = job.dangling_dependency() {
            return Err(EngineError::TaskNotFound(dep));
        }

        let mut registry = self.registry.write().await;
        if let Some(missing) = job
            .job_dependencies()
            .iter()
            .find(|dep| !registry.jobs.contains_key(dep))
        {
            return Err(EngineError::JobNotFound(*missing));
        }

        let (id, dir) = self.allocate(&registry)?;
        job.assign(id, dir.clone());
        if let Err(e) = job.save() {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        tracing::info!(job_id = %id, name = job.name(), tasks = job.tasks().len(), "job registered");
        registry.insert(job);
        drop(registry);

        self.changed.notify_one();
        Ok(id)
    }

    /// Pick an unused ID and claim its directory. Collisions are retried, never overwritten.
    fn allocate(&self, registry: &Registry) -> Result<(JobId, PathBuf)> {
        let mut last = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.generate_job_id();
            last = Some(id);
            if id.is_nil() || registry.jobs.contains_key(&id) {
                tracing::warn!(job_id = %id, "job id collision in registry; retrying");
                continue;
            }
            let dir = self.root.join(id.to_string());
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tracing::warn!(job_id = %id, "job directory already exists; retrying");
                }
                Err(e) => return Err(PersistenceError::io(&dir, e).into()),
            }
        }
        Err(EngineError::DuplicateId(
            last.map(|id| id.to_string()).unwrap_or_default(),
        ))
    }

    pub(crate) async fn handle(&self, id: JobId) -> Result<SharedJob> {
        let registry = self.registry.read().await;
        registry
            .jobs
            .get(&id)
            .map(|entry| Arc::clone(&entry.job))
            .ok_or(EngineError::JobNotFound(id))
    }

    async fn locked(&self, id: JobId) -> Result<OwnedMutexGuard<Job>> {
        Ok(self.handle(id).await?.lock_owned().await)
    }

    /// Snapshot of one job.
    pub async fn get(&self, id: JobId) -> Result<Job> {
        Ok(self.locked(id).await?.clone())
    }

    /// Jobs matching `filter`, most recently created first.
    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs = Vec::new();
        for (seq, shared) in self.entries().await {
            let job = shared.lock().await;
            if filter.matches(&job) {
                jobs.push((seq, job.clone()));
            }
        }
        jobs.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| seq_b.cmp(seq_a))
        });
        jobs.into_iter().map(|(_, job)| job).collect()
    }

    pub async fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for (_, shared) in self.entries().await {
            counts.record(shared.lock().await.status());
        }
        counts
    }

    /// True when every registered job has settled.
    pub async fn all_settled(&self) -> bool {
        for (_, shared) in self.entries().await {
            if !shared.lock().await.is_settled() {
                return false;
            }
        }
        true
    }

    async fn entries(&self) -> Vec<(u64, SharedJob)> {
        let registry = self.registry.read().await;
        registry
            .jobs
            .values()
            .map(|entry| (entry.seq, Arc::clone(&entry.job)))
            .collect()
    }

    /// All jobs in registration order.
    pub(crate) async fn jobs_in_order(&self) -> Vec<(JobId, SharedJob)> {
        let registry = self.registry.read().await;
        let mut jobs: Vec<(u64, JobId, SharedJob)> = registry
            .jobs
            .iter()
            .map(|(id, entry)| (entry.seq, *id, Arc::clone(&entry.job)))
            .collect();
        jobs.sort_by_key(|(seq, _, _)| *seq);
        jobs.into_iter().map(|(_, id, job)| (id, job)).collect()
    }

    /// Add a task to a registered job that has not started yet.
    pub async fn add_task(&self, id: JobId, task: Task) -> Result<TaskId> {
        let mut job = self.locked(id).await?;
        let task_id = job.add_task(task)?;
        self.commit(&mut job, true)?;
        Ok(task_id)
    }

    /// Cancel every unfinished task of a job. Idempotent.
    pub async fn abort(&self, id: JobId) -> Result<()> {
        let mut job = self.locked(id).await?;
        job.abort();
        tracing::info!(job_id = %id, status = %job.status(), "job abort requested");
        self.commit(&mut job, false)
    }

    pub async fn cancel_task(&self, id: JobId, task: TaskId) -> Result<()> {
        let mut job = self.locked(id).await?;
        job.cancel_task(task)?;
        self.commit(&mut job, false)
    }

    /// Remove a job and its working directory.
    ///
    /// Rejected while another unsettled job depends on it. A job with running tasks is
    /// aborted first; whatever its workers report afterwards is discarded.
    pub async fn delete(&self, id: JobId) -> Result<()> {
        let mut registry = self.registry.write().await;
        let shared = registry
            .jobs
            .get(&id)
            .map(|entry| Arc::clone(&entry.job))
            .ok_or(EngineError::JobNotFound(id))?;

        let mut dependents = Vec::new();
        for (other_id, entry) in registry.jobs.iter() {
            if *other_id == id {
                continue;
            }
            let other = entry.job.lock().await;
            if other.job_dependencies().contains(&id) && !other.is_settled() {
                dependents.push(*other_id);
            }
        }
        if !dependents.is_empty() {
            dependents.sort();
            return Err(EngineError::HasDependents { job: id, dependents });
        }

        let mut job = shared.lock().await;
        if !job.is_settled() {
            job.abort();
            if let Err(e) = self.commit(&mut job, false) {
                tracing::warn!(job_id = %id, error = %e, "cannot persist abort before delete");
            }
        }
        let dir = job.work_dir().to_path_buf();
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PersistenceError::io(&dir, e).into()),
        }
        drop(job);
        registry.jobs.remove(&id);
        drop(registry);

        tracing::info!(job_id = %id, "job deleted");
        self.changed.notify_one();
        Ok(())
    }

    /// Apply `f` to a job and commit the resulting events.
    ///
    /// Returns `f`'s result. A failed save is logged rather than returned: the in-memory
    /// state already moved on and the caller (the scheduler) has no better recovery.
    pub(crate) async fn update<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> Result<R>) -> Result<R> {
        let mut job = self.locked(id).await?;
        let out = f(&mut job);
        if let Err(e) = self.commit(&mut job, false) {
            tracing::error!(job_id = %id, error = %e, "failed to persist job state");
        }
        out
    }

    /// Persist and publish what happened to `job` since the last commit.
    ///
    /// Status changes (or `force_save`) write a full snapshot; anything else only appends logs.
    fn commit(&self, job: &mut Job, force_save: bool) -> Result<()> {
        let events = job.drain_events();
        let status_changed = events.iter().any(JobEvent::affects_status);

        let saved = if status_changed || force_save {
            job.save()
        } else if !events.is_empty() {
            job.flush_logs()
        } else {
            Ok(())
        };

        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
        if status_changed {
            self.changed.notify_one();
        }
        saved
    }

    /// Decide whether the prerequisites of a job let it run.
    pub(crate) async fn resolve_job_dependencies(&self, deps: &[JobId]) -> Gate {
        let mut gate = Gate::Open;
        for &dep in deps {
            let Ok(shared) = self.handle(dep).await else {
                return Gate::Broken(format!("prerequisite job {dep} no longer exists"));
            };
            let status = shared.lock().await.status();
            match status {
                Status::Done => {}
                Status::Error | Status::Aborted => {
                    return Gate::Broken(format!("prerequisite job {dep} ended {status}"));
                }
                _ => gate = Gate::Closed,
            }
        }
        gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LogLevel;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(name: &str, tasks: usize) -> Job {
        let mut job = Job::new(name);
        for i in 0..tasks {
            job.add_task(Task::new(format!("t{i}"), "noop")).unwrap();
        }
        job
    }

    fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        (dir, store)
    }

    /// Hands out the same ID for the first `repeat` calls, then fresh ones.
    struct Repeating {
        id: JobId,
        repeat: usize,
        calls: AtomicUsize,
    }

    impl IdGenerator for Repeating {
        fn generate_job_id(&self) -> JobId {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.repeat {
                self.id
            } else {
                JobId::generate()
            }
        }
    }

    #[tokio::test]
    async fn register_assigns_id_and_creates_working_directory() {
        let (dir, store) = store();
        let id = store.register(job("dataset", 2)).await.unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.id(), id);
        assert_eq!(job.work_dir(), dir.path().join(id.to_string()));
        assert!(persist::is_job_dir(job.work_dir()));
    }

    #[tokio::test]
    async fn register_retries_id_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let taken = JobId::generate();
        let store = JobStore::new(dir.path()).unwrap().with_id_generator(Repeating {
            id: taken,
            repeat: 2,
            calls: AtomicUsize::new(0),
        });

        let first = store.register(job("a", 1)).await.unwrap();
        assert_eq!(first, taken);
        let second = store.register(job("b", 1)).await.unwrap();
        assert_ne!(second, taken);
        assert_eq!(store.get(first).await.unwrap().name(), "a");
    }

    #[tokio::test]
    async fn register_gives_up_with_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let taken = JobId::generate();
        let store = JobStore::new(dir.path()).unwrap().with_id_generator(Repeating {
            id: taken,
            repeat: usize::MAX,
            calls: AtomicUsize::new(0),
        });

        store.register(job("a", 1)).await.unwrap();
        let err = store.register(job("b", 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(_)));
        assert_eq!(store.get(taken).await.unwrap().name(), "a");
    }

    #[tokio::test]
    async fn register_rejects_dangling_dependencies() {
        let (_dir, store) = store();
        let mut j = Job::new("dangling");
        let ghost = TaskId::generate();
        j.add_task(Task::new("a", "noop").depends_on(ghost)).unwrap();
        assert!(matches!(
            store.register(j).await,
            Err(EngineError::TaskNotFound(id)) if id == ghost
        ));

        let unknown = JobId::generate();
        let j = job("needs-parent", 1).depends_on_job(unknown);
        assert!(matches!(
            store.register(j).await,
            Err(EngineError::JobNotFound(id)) if id == unknown
        ));
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let (_dir, store) = store();
        assert!(store.get(JobId::generate()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filters() {
        let (_dir, store) = store();
        let a = store.register(job("mnist dataset", 1)).await.unwrap();
        let b = store.register(job("lenet model", 1)).await.unwrap();
        let c = store.register(job("cifar dataset", 1)).await.unwrap();
        store.abort(b).await.unwrap();

        let all: Vec<JobId> = store.list(&JobFilter::default()).await.iter().map(Job::id).collect();
        assert_eq!(all, vec![c, b, a]);

        let datasets: Vec<JobId> = store
            .list(&JobFilter::default().with_name("DATASET"))
            .await
            .iter()
            .map(Job::id)
            .collect();
        assert_eq!(datasets, vec![c, a]);

        let aborted: Vec<JobId> = store
            .list(&JobFilter::default().with_status(Status::Aborted))
            .await
            .iter()
            .map(Job::id)
            .collect();
        assert_eq!(aborted, vec![b]);
    }

    #[tokio::test]
    async fn add_task_is_persisted_and_frozen_after_start() {
        let (_dir, store) = store();
        let id = store.register(job("j", 0)).await.unwrap();
        store.add_task(id, Task::new("late", "noop")).await.unwrap();

        let reloaded = Job::load(store.get(id).await.unwrap().work_dir()).unwrap();
        assert_eq!(reloaded.tasks().len(), 1);

        store
            .update(id, |job| {
                job.begin();
                Ok(())
            })
            .await
            .unwrap();
        assert!(matches!(
            store.add_task(id, Task::new("too late", "noop")).await,
            Err(EngineError::JobAlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let (_dir, store) = store();
        let mut j = Job::new("events");
        let task = j.add_task(Task::new("a", "noop")).unwrap();
        let id = store.register(j).await.unwrap();
        let mut rx = store.subscribe();

        store
            .update(id, |job| {
                job.start_task(task)?;
                job.log(task, LogLevel::Info, "hello")
            })
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.job_id, id);
            kinds.push(event.kind);
        }
        assert!(kinds.iter().any(|k| matches!(
            k,
            crate::domain::EventKind::Status { to: Status::Running, .. }
        )));
        assert!(kinds.iter().any(|k| matches!(
            k,
            crate::domain::EventKind::Log { message, .. } if message == "hello"
        )));
    }

    #[tokio::test]
    async fn delete_is_blocked_by_active_dependents() {
        let (_dir, store) = store();
        let parent = store.register(job("dataset", 1)).await.unwrap();
        let mut child_job = job("model", 1).depends_on_job(parent);
        let child_task = child_job.tasks()[0].id();
        child_job.begin();
        let child = store.register(child_job).await.unwrap();
        assert_eq!(store.get(child).await.unwrap().status(), Status::Running);

        let err = store.delete(parent).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::HasDependents { ref dependents, .. } if dependents == &vec![child]
        ));

        store
            .update(child, |job| {
                job.start_task(child_task)?;
                job.complete_task(child_task, json!(null))
            })
            .await
            .unwrap();
        let parent_dir = store.get(parent).await.unwrap().work_dir().to_path_buf();
        store.delete(parent).await.unwrap();
        assert!(!parent_dir.exists());
        assert!(store.get(parent).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn load_all_restores_jobs_and_fails_running_ones() {
        let dir = tempfile::tempdir().unwrap();
        let (idle, running, done) = {
            let store = JobStore::new(dir.path()).unwrap();
            let idle = store.register(job("idle", 1)).await.unwrap();
            let running = store.register(job("running", 2)).await.unwrap();
            let done = store.register(job("done", 1)).await.unwrap();
            for id in [running, done] {
                store
                    .update(id, |job| {
                        let first = job.tasks()[0].id();
                        job.begin();
                        job.start_task(first)?;
                        if job.name() == "done" {
                            job.complete_task(first, json!(1))?;
                        }
                        Ok(())
                    })
                    .await
                    .unwrap();
            }
            (idle, running, done)
        };
        std::fs::create_dir(dir.path().join("not-a-job")).unwrap();

        let store = JobStore::new(dir.path()).unwrap();
        let report = store.load_all().await.unwrap();
        assert_eq!(report.restored, vec![idle, running, done]);
        assert_eq!(report.recovered, vec![running]);
        assert!(report.failed.is_empty());

        assert_eq!(store.get(idle).await.unwrap().status(), Status::Init);
        assert_eq!(store.get(done).await.unwrap().status(), Status::Done);
        let recovered = store.get(running).await.unwrap();
        assert_eq!(recovered.status(), Status::Error);
        assert!(recovered.is_settled());

        // the recovery itself was persisted
        let on_disk = Job::load(recovered.work_dir()).unwrap();
        assert_eq!(on_disk.status(), Status::Error);
    }

    #[tokio::test]
    async fn load_all_fails_running_sibling_of_an_errored_job() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = JobStore::new(dir.path()).unwrap();
            let id = store.register(job("half-failed", 2)).await.unwrap();
            store
                .update(id, |job| {
                    let (a, b) = (job.tasks()[0].id(), job.tasks()[1].id());
                    job.begin();
                    job.start_task(a)?;
                    job.start_task(b)?;
                    job.fail_task(a, "boom")
                })
                .await
                .unwrap();
            assert_eq!(store.get(id).await.unwrap().status(), Status::Error);
            id
        };

        let store = JobStore::new(dir.path()).unwrap();
        let report = store.load_all().await.unwrap();
        assert_eq!(report.recovered, vec![id]);

        let job = store.get(id).await.unwrap();
        assert_eq!(job.tasks()[1].status(), Status::Error);
        assert!(job.is_settled());
        assert!(store.all_settled().await);
        assert!(Job::load(job.work_dir()).unwrap().is_settled());
    }

    #[tokio::test]
    async fn load_all_reports_corrupted_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("job-broken");
        std::fs::create_dir(&bad).unwrap();
        std::fs::write(persist::snapshot_path(&bad), b"garbage").unwrap();

        let store = JobStore::new(dir.path()).unwrap();
        let report = store.load_all().await.unwrap();
        assert!(report.restored.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, bad);
    }

    #[tokio::test]
    async fn counts_follow_derived_status() {
        let (_dir, store) = store();
        store.register(job("a", 1)).await.unwrap();
        let b = store.register(job("b", 1)).await.unwrap();
        store.abort(b).await.unwrap();

        let counts = store.counts().await;
        assert_eq!(counts.init, 1);
        assert_eq!(counts.aborted, 1);
        assert!(!store.all_settled().await);
    }

    #[tokio::test]
    async fn job_dependency_gate() {
        let (_dir, store) = store();
        let parent = store.register(job("parent", 1)).await.unwrap();
        assert_eq!(store.resolve_job_dependencies(&[parent]).await, Gate::Closed);

        store.abort(parent).await.unwrap();
        assert!(matches!(
            store.resolve_job_dependencies(&[parent]).await,
            Gate::Broken(reason) if reason.contains("aborted")
        ));
        assert!(matches!(
            store.resolve_job_dependencies(&[JobId::generate()]).await,
            Gate::Broken(_)
        ));
        assert_eq!(store.resolve_job_dependencies(&[]).await, Gate::Open);
    }
}
