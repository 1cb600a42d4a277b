//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULIDs wrapped in a phantom-typed `Id<T>`:
//! - sortable by creation time (the timestamp sits in the high bits)
//! - 128-bit, the same size as a UUID
//! - rendered as `job-<ULID>` / `task-<ULID>`, which is safe to use as a directory or file name
//!
//! `JobId` and `TaskId` are distinct types, so they cannot be mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID kind. Supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ID.
///
/// `T` only exists at compile time (PhantomData), so an `Id<T>` is exactly one ULID in memory
/// and a plain ULID string on the wire.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh ID from the system clock.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    /// The all-zero ID, used by jobs that have not been registered yet.
    pub fn nil() -> Self {
        Self::from_ulid(Ulid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.ulid.is_nil()
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Deterministic IDs for tests.
    #[cfg(test)]
    pub(crate) fn from_u128(value: u128) -> Self {
        Self::from_ulid(Ulid::from_bytes(value.to_be_bytes()))
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid prefixed ID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id `{input}`: expected `{prefix}<ULID>`")]
pub struct ParseIdError {
    input: String,
    prefix: &'static str,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed form (`job-01H...`) and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                input: s.to_string(),
                prefix: T::prefix(),
            })
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of a Job (registration / status / abort / delete unit).
pub type JobId = Id<Job>;

/// Identifier of a Task (schedulable unit within a Job).
pub type TaskId = Id<Task>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let job = JobId::generate();
        let task = TaskId::generate();

        assert!(job.to_string().starts_with("job-"));
        assert!(task.to_string().starts_with("task-"));

        // let _: JobId = task; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = JobId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::generate();

        assert!(id1 < id2);
    }

    #[test]
    fn serializes_as_bare_ulid_string() {
        let ulid = Ulid::new();
        let job_id = JobId::from_ulid(ulid);

        let json = serde_json::to_string(&job_id).unwrap();
        assert_eq!(json, format!("\"{ulid}\""));

        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job_id);
    }

    #[test]
    fn parses_display_form_and_bare_ulid() {
        let id = TaskId::generate();
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert_eq!(id.as_ulid().to_string().parse::<TaskId>().unwrap(), id);
    }

    #[test]
    fn rejects_garbage() {
        let err = "job-not-a-ulid".parse::<JobId>().unwrap_err();
        assert!(err.to_string().contains("job-"));
    }

    #[test]
    fn nil_is_recognised() {
        assert!(JobId::nil().is_nil());
        assert!(!JobId::generate().is_nil());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<TaskId>(), 16);
    }
}
