//! On-disk format of a job working directory.
//!
//! ```text
//! <work_dir>/
//!     job.json             {"schema_version": 1, "job": {...}}
//!     job.json.tmp         written first, then renamed over job.json
//!     logs/<task-id>.log   one JSON `LogEntry` per line, append-only
//! ```
//!
//! A failed save leaves the previous `job.json` intact: the new snapshot is fully
//! written and synced to the temp file before the rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{Job, LogEntry, TaskId};
use crate::error::PersistenceError;

/// Version written into every snapshot. Bump when the layout of `Job` changes.
pub const SCHEMA_VERSION: u32 = 1;

pub const SNAPSHOT_FILE: &str = "job.json";
const SNAPSHOT_TMP: &str = "job.json.tmp";
const LOG_DIR: &str = "logs";

#[derive(Serialize)]
struct SnapshotOut<'a> {
    schema_version: u32,
    job: &'a Job,
}

#[derive(Deserialize)]
struct SnapshotIn {
    schema_version: u32,
    job: serde_json::Value,
}

pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE)
}

pub fn log_path(dir: &Path, task: TaskId) -> PathBuf {
    dir.join(LOG_DIR).join(format!("{task}.log"))
}

/// Does `dir` look like a job working directory?
pub fn is_job_dir(dir: &Path) -> bool {
    snapshot_path(dir).is_file()
}

pub fn write_snapshot(dir: &Path, job: &Job) -> Result<(), PersistenceError> {
    let target = snapshot_path(dir);
    let tmp = dir.join(SNAPSHOT_TMP);
    let bytes = serde_json::to_vec_pretty(&SnapshotOut {
        schema_version: SCHEMA_VERSION,
        job,
    })
    .map_err(|e| PersistenceError::serde(&target, e))?;

    let mut file = File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
    file.write_all(&bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| PersistenceError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, &target).map_err(|e| PersistenceError::io(&target, e))?;
    tracing::trace!(path = %target.display(), bytes = bytes.len(), "snapshot written");
    Ok(())
}

pub fn read_snapshot(dir: &Path) -> Result<Job, PersistenceError> {
    let path = snapshot_path(dir);
    let bytes = fs::read(&path).map_err(|e| PersistenceError::io(&path, e))?;
    let snapshot: SnapshotIn =
        serde_json::from_slice(&bytes).map_err(|e| PersistenceError::serde(&path, e))?;

    match snapshot.schema_version {
        1 => serde_json::from_value(snapshot.job).map_err(|e| PersistenceError::serde(&path, e)),
        found => Err(PersistenceError::UnsupportedSchema {
            path,
            found,
            supported: SCHEMA_VERSION,
        }),
    }
}

pub fn append_log(dir: &Path, task: TaskId, entries: &[LogEntry]) -> Result<(), PersistenceError> {
    let path = log_path(dir, task);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
    }

    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry).map_err(|e| PersistenceError::serde(&path, e))?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| PersistenceError::io(&path, e))?;
    file.write_all(&buf)
        .and_then(|_| file.flush())
        .map_err(|e| PersistenceError::io(&path, e))
}

/// Read a task log. A missing file is an empty log; a torn last line (the process died
/// mid-append) is dropped.
pub fn read_log(dir: &Path, task: TaskId) -> Result<Vec<LogEntry>, PersistenceError> {
    let path = log_path(dir, task);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PersistenceError::io(&path, e)),
    };

    let lines = BufReader::new(file)
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PersistenceError::io(&path, e))?;

    let mut entries = Vec::with_capacity(lines.len());
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if i == last => {
                tracing::warn!(path = %path.display(), error = %e, "dropping torn log line");
            }
            Err(e) => return Err(PersistenceError::serde(&path, e)),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, LogLevel, Task};

    fn registered_job(dir: &Path) -> Job {
        let mut job = Job::new("persist");
        job.add_task(Task::new("a", "noop")).unwrap();
        job.assign(JobId::generate(), dir.to_path_buf());
        job
    }

    #[test]
    fn snapshot_carries_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let job = registered_job(dir.path());
        write_snapshot(dir.path(), &job).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(snapshot_path(dir.path())).unwrap()).unwrap();
        assert_eq!(raw["schema_version"], SCHEMA_VERSION);
        assert_eq!(raw["job"]["name"], "persist");
        assert!(!dir.path().join(SNAPSHOT_TMP).exists());
    }

    #[test]
    fn future_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            snapshot_path(dir.path()),
            r#"{"schema_version": 99, "job": {}}"#,
        )
        .unwrap();

        let err = read_snapshot(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::UnsupportedSchema { found: 99, .. }
        ));
    }

    #[test]
    fn corrupted_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(snapshot_path(dir.path()), b"{ not json").unwrap();
        assert!(matches!(
            read_snapshot(dir.path()),
            Err(PersistenceError::Serde { .. })
        ));
    }

    #[test]
    fn failed_write_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let job = registered_job(dir.path());
        write_snapshot(dir.path(), &job).unwrap();
        let before = fs::read(snapshot_path(dir.path())).unwrap();

        // a directory squatting on the temp path makes File::create fail
        fs::create_dir(dir.path().join(SNAPSHOT_TMP)).unwrap();
        assert!(matches!(
            write_snapshot(dir.path(), &job),
            Err(PersistenceError::Io { .. })
        ));
        assert_eq!(fs::read(snapshot_path(dir.path())).unwrap(), before);
    }

    #[test]
    fn log_appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let task = TaskId::generate();
        let first = vec![LogEntry::new(LogLevel::Info, "one")];
        let second = vec![
            LogEntry::new(LogLevel::Warning, "two"),
            LogEntry::new(LogLevel::Error, "three"),
        ];
        append_log(dir.path(), task, &first).unwrap();
        append_log(dir.path(), task, &second).unwrap();

        let read = read_log(dir.path(), task).unwrap();
        assert_eq!(read, [first, second].concat());
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_log(dir.path(), TaskId::generate()).unwrap().is_empty());
    }

    #[test]
    fn torn_last_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let task = TaskId::generate();
        append_log(dir.path(), task, &[LogEntry::new(LogLevel::Info, "kept")]).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(log_path(dir.path(), task))
            .unwrap();
        file.write_all(br#"{"at": "2024-01-0"#).unwrap();

        let read = read_log(dir.path(), task).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].message, "kept");
    }
}
