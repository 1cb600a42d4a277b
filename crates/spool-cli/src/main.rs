use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use spool_core::{
    CommandExecutor, CommandParams, EngineConfig, EventKind, ExecutorRegistry, Job, JobFilter, JobId, JobStore,
    Scheduler, Status, Task, init_tracing,
};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(name = "spool")]
#[command(version)]
#[command(about = "Run and inspect dependency-ordered jobs")]
#[command(propagate_version = true)]
struct Args {
    /// Engine config (TOML). Defaults apply to anything it leaves out.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Job root directory; overrides `root_dir` from the config
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register job definitions and run everything until it settles
    Run {
        /// Job definition files (JSON)
        files: Vec<PathBuf>,

        /// Override the number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// List jobs, newest first
    List {
        /// Only jobs in this status (init, waiting, running, done, error, aborted)
        #[arg(long)]
        status: Option<Status>,

        /// Only jobs whose name contains this text
        #[arg(long)]
        name: Option<String>,
    },

    /// Show one job with its tasks and logs
    Show {
        job_id: JobId,

        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a job and its working directory
    Delete { job_id: JobId },
}

// =============================================================================
// Job definition files
// =============================================================================

/// On-disk job definition. Tasks refer to each other by `key`.
///
/// ```json
/// {
///   "name": "nightly",
///   "tasks": [
///     {"key": "fetch", "kind": "command", "params": {"program": "curl", "args": ["-O", "..."]}},
///     {"key": "unpack", "kind": "command", "params": {"program": "tar", "args": ["xf", "data.tar"]},
///      "depends_on": ["fetch"]}
///   ]
/// }
/// ```
#[derive(Debug, Deserialize)]
struct JobDefinition {
    name: String,
    #[serde(default)]
    depends_on_jobs: Vec<String>,
    tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Deserialize)]
struct TaskDefinition {
    key: String,
    #[serde(default)]
    name: Option<String>,
    kind: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    depends_on: Vec<String>,
}

impl JobDefinition {
    fn read(path: &Path) -> CliResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
        Ok(serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))?)
    }

    fn into_job(self) -> CliResult<Job> {
        let mut job = Job::new(self.name);
        for dep in &self.depends_on_jobs {
            job.add_job_dependency(dep.parse()?)?;
        }

        let mut ids = HashMap::new();
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for def in &self.tasks {
            let task = Task::new(def.name.clone().unwrap_or_else(|| def.key.clone()), def.kind.clone())
                .with_params(def.params.clone());
            if ids.insert(def.key.clone(), task.id()).is_some() {
                return Err(format!("duplicate task key {:?}", def.key).into());
            }
            tasks.push(task);
        }

        for (def, task) in self.tasks.iter().zip(tasks) {
            let mut task = task;
            for key in &def.depends_on {
                let dep = ids
                    .get(key)
                    .ok_or_else(|| format!("task {:?} depends on unknown key {:?}", def.key, key))?;
                task = task.depends_on(*dep);
            }
            job.add_task(task)?;
        }
        Ok(job)
    }
}

// =============================================================================
// Commands
// =============================================================================

fn load_config(args: &Args) -> CliResult<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &args.root {
        config.root_dir = root.clone();
    }
    Ok(config)
}

async fn open_store(config: &EngineConfig) -> CliResult<Arc<JobStore>> {
    let store = JobStore::new(&config.root_dir)?;
    let report = store.load_all().await?;
    for (path, error) in &report.failed {
        eprintln!("warning: skipped {}: {error}", path.display());
    }
    for id in &report.recovered {
        eprintln!("warning: {id} was interrupted by a previous run and is now error");
    }
    Ok(Arc::new(store))
}

async fn run(config: EngineConfig, files: Vec<PathBuf>) -> CliResult<ExitCode> {
    let store = open_store(&config).await?;

    let mut registry = ExecutorRegistry::new();
    registry.register_typed::<CommandParams, _>(CommandExecutor)?;

    let mut submitted = Vec::new();
    for file in &files {
        let job = JobDefinition::read(file)?.into_job()?;
        let id = store.register(job).await?;
        println!("registered {id} from {}", file.display());
        submitted.push(id);
    }

    let mut events = store.subscribe();
    let handle = Scheduler::new(Arc::clone(&store), Arc::new(registry), config.scheduler.clone()).spawn();

    while !store.all_settled().await {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let EventKind::Status { to, .. } = event.kind {
                        println!("{} {} {}", event.job_id, event.task_id, to);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
        }
    }
    handle.shutdown_and_join().await;

    let mut failed = false;
    for id in submitted {
        let job = store.get(id).await?;
        println!("{id} {} {}", job.name(), job.status());
        failed |= job.status() != Status::Done;
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn list(config: EngineConfig, status: Option<Status>, name: Option<String>) -> CliResult<()> {
    let store = open_store(&config).await?;
    let filter = JobFilter {
        status,
        name_contains: name,
    };
    for job in store.list(&filter).await {
        println!(
            "{}  {:<8}  {:>3.0}%  {}  {}",
            job.id(),
            job.status(),
            job.progress() * 100.0,
            job.created_at().format("%Y-%m-%d %H:%M:%S"),
            job.name()
        );
    }
    Ok(())
}

async fn show(config: EngineConfig, id: JobId, json: bool) -> CliResult<()> {
    let store = open_store(&config).await?;
    let job = store.get(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("{}  {}  {}", job.id(), job.name(), job.status());
    println!("  dir      {}", job.work_dir().display());
    for dep in job.job_dependencies() {
        println!("  after    {dep}");
    }
    for task in job.tasks() {
        println!(
            "  {}  {:<8}  {:>3.0}%  {} ({})",
            task.id(),
            task.status(),
            task.progress() * 100.0,
            task.name(),
            task.kind()
        );
        if let Some(error) = task.error() {
            println!("      error: {error}");
        }
        for entry in task.log() {
            println!("      {} [{}] {}", entry.at.format("%H:%M:%S"), entry.level, entry.message);
        }
    }
    Ok(())
}

async fn delete(config: EngineConfig, id: JobId) -> CliResult<()> {
    let store = open_store(&config).await?;
    store.delete(id).await?;
    println!("deleted {id}");
    Ok(())
}

async fn dispatch(args: Args) -> CliResult<ExitCode> {
    let config = load_config(&args)?;
    // a second init (tests) is harmless
    let _ = init_tracing(&config.logging);

    match args.command {
        Commands::Run { files, workers } => {
            let config = match workers {
                Some(n) => config.with_workers(n),
                None => config,
            };
            run(config, files).await
        }
        Commands::List { status, name } => list(config, status, name).await.map(|()| ExitCode::SUCCESS),
        Commands::Show { job_id, json } => show(config, job_id, json).await.map(|()| ExitCode::SUCCESS),
        Commands::Delete { job_id } => delete(config, job_id).await.map(|()| ExitCode::SUCCESS),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_resolves_keys_in_any_order() {
        let def: JobDefinition = serde_json::from_str(
            r#"{
                "name": "pipeline",
                "tasks": [
                    {"key": "b", "kind": "command", "depends_on": ["a"]},
                    {"key": "a", "name": "first", "kind": "command", "params": {"program": "true"}}
                ]
            }"#,
        )
        .unwrap();
        let job = def.into_job().unwrap();

        let b = &job.tasks()[0];
        let a = &job.tasks()[1];
        assert_eq!(a.name(), "first");
        assert_eq!(b.name(), "b");
        assert_eq!(b.dependencies(), &[a.id()]);
        assert_eq!(a.params()["program"], "true");
    }

    #[test]
    fn unknown_and_duplicate_keys_are_rejected() {
        let unknown: JobDefinition = serde_json::from_str(
            r#"{"name": "x", "tasks": [{"key": "a", "kind": "k", "depends_on": ["ghost"]}]}"#,
        )
        .unwrap();
        assert!(unknown.into_job().unwrap_err().to_string().contains("ghost"));

        let duplicate: JobDefinition = serde_json::from_str(
            r#"{"name": "x", "tasks": [{"key": "a", "kind": "k"}, {"key": "a", "kind": "k"}]}"#,
        )
        .unwrap();
        assert!(duplicate.into_job().is_err());
    }

    #[test]
    fn cycles_are_rejected() {
        let def: JobDefinition = serde_json::from_str(
            r#"{"name": "x", "tasks": [
                {"key": "a", "kind": "k", "depends_on": ["b"]},
                {"key": "b", "kind": "k", "depends_on": ["a"]}
            ]}"#,
        )
        .unwrap();
        assert!(def.into_job().unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn cli_parses_subcommands() {
        let args = Args::try_parse_from(["spool", "--root", "/tmp/jobs", "list", "--status", "error"]).unwrap();
        assert_eq!(args.root, Some(PathBuf::from("/tmp/jobs")));
        assert!(matches!(
            args.command,
            Commands::List {
                status: Some(Status::Error),
                ..
            }
        ));

        let args = Args::try_parse_from(["spool", "run", "a.json", "b.json", "--workers", "4"]).unwrap();
        assert!(matches!(args.command, Commands::Run { ref files, workers: Some(4) } if files.len() == 2));
    }
}
