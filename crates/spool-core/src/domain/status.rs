//! Lifecycle status shared by tasks and jobs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state.
///
/// State transitions:
/// - Init -> Waiting -> Running -> Done | Error | Aborted
/// - Init -> Running (no unmet dependencies)
/// - Init | Waiting -> Aborted (cancelled before start)
/// - Init | Waiting -> Error (a dependency failed)
///
/// Terminal states (`Done`, `Error`, `Aborted`) have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Init,
    Waiting,
    Running,
    Done,
    Error,
    Aborted,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Init,
        Status::Waiting,
        Status::Running,
        Status::Done,
        Status::Error,
        Status::Aborted,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error | Status::Aborted)
    }

    /// Not started yet: eligible for `start` once dependencies are done.
    pub fn is_pending(self) -> bool {
        matches!(self, Status::Init | Status::Waiting)
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (Init, Waiting | Running | Error | Aborted) => true,
            (Waiting, Running | Error | Aborted) => true,
            (Running, Done | Error | Aborted) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Init => "init",
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Done => "done",
            Status::Error => "error",
            Status::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status `{0}`")]
pub struct ParseStatusError(String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Job status as a pure function of its task statuses.
///
/// - any `Error` -> `Error`
/// - any `Aborted` and none `Running` -> `Aborted`
/// - any `Running` or `Waiting` -> `Running`
/// - all `Done` (including no tasks at all) -> `Done`
/// - all `Init` -> `Init`
/// - otherwise (`Init` mixed with `Done`) -> `Running`
pub fn derive_job_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut any = [false; 6];
    let mut count = 0usize;
    for status in statuses {
        any[status as usize] = true;
        count += 1;
    }
    let has = |s: Status| any[s as usize];

    if has(Status::Error) {
        Status::Error
    } else if has(Status::Aborted) && !has(Status::Running) {
        Status::Aborted
    } else if has(Status::Running) || has(Status::Waiting) {
        Status::Running
    } else if count == 0 || !has(Status::Init) {
        // only Done remains
        Status::Done
    } else if !has(Status::Done) {
        Status::Init
    } else {
        Status::Running
    }
}
