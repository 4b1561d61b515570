//! Task records, their lifecycle status, and executor outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Task Key
// ---------------------------------------------------------------------------

/// Natural identity of a task (e.g. an account identifier). Unique per file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey(pub String);

impl TaskKey {
    /// Keys are compared after trimming surrounding whitespace.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(key.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Not yet attempted. An empty status cell reads as pending.
    Pending,
    /// Claimed by a running execution.
    InProgress,
    /// Finished successfully. Terminal.
    Done,
    /// Finished unsuccessfully. Terminal unless an operator resets it.
    Failed,
    /// Transient failure; picked up again by the next cycle.
    NeedsRetry,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::InProgress,
        Status::Done,
        Status::Failed,
        Status::NeedsRetry,
    ];

    /// Parse a status cell. Empty means pending; unknown values yield `None`.
    pub fn parse(cell: &str) -> Option<Status> {
        match cell.trim() {
            "" | "pending" => Some(Status::Pending),
            "in-progress" => Some(Status::InProgress),
            "done" => Some(Status::Done),
            "failed" => Some(Status::Failed),
            "needs-retry" => Some(Status::NeedsRetry),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in-progress",
            Status::Done => "done",
            Status::Failed => "failed",
            Status::NeedsRetry => "needs-retry",
        }
    }

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (NeedsRetry, InProgress)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, NeedsRetry) // transient failure or stale claim
                | (NeedsRetry, Pending)
                | (Failed, Pending) // operator reset
        )
    }

    /// Eligible for dispatch in the next cycle.
    pub fn is_pending(self) -> bool {
        matches!(self, Status::Pending | Status::NeedsRetry)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::parse(s).ok_or_else(|| format!("unknown status {s:?}"))
    }
}

// ---------------------------------------------------------------------------
// Task Record
// ---------------------------------------------------------------------------

/// One row of the task source, with bookkeeping columns split out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub key: TaskKey,
    pub status: Status,
    /// Failure detail or other note from the last attempt.
    pub detail: Option<String>,
    /// Number of executions started for this task.
    pub attempts: u32,
    /// Execution that currently holds (or last held) the claim.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Every other column. Opaque to the queue; handed to the executor.
    pub params: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What the executor reported for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    InvalidCredentials,
    /// Rate-limited or flagged by the remote side.
    Blocked,
    /// Anything else, kept verbatim as detail.
    Failure(String),
}

impl Outcome {
    /// Map a raw executor code onto the fixed vocabulary.
    pub fn from_code(code: &str) -> Outcome {
        match code.trim() {
            "success" => Outcome::Success,
            "invalid-credentials" => Outcome::InvalidCredentials,
            "blocked" => Outcome::Blocked,
            other => Outcome::Failure(other.to_string()),
        }
    }

    /// Short label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::InvalidCredentials => "invalid-credentials",
            Outcome::Blocked => "blocked",
            Outcome::Failure(_) => "failure",
        }
    }

    /// Status and detail to persist after `attempts` executions.
    ///
    /// `Blocked` is retried until `max_attempts` is reached.
    pub fn resolve(&self, attempts: u32, max_attempts: u32) -> (Status, Option<String>) {
        match self {
            Outcome::Success => (Status::Done, None),
            Outcome::InvalidCredentials => {
                (Status::Failed, Some("invalid-credentials".to_string()))
            }
            Outcome::Blocked if attempts < max_attempts => {
                (Status::NeedsRetry, Some("blocked".to_string()))
            }
            Outcome::Blocked => (
                Status::Failed,
                Some(format!("blocked: retries exhausted after {attempts} attempts")),
            ),
            Outcome::Failure(detail) => (Status::Failed, Some(detail.clone())),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Failure(detail) => write!(f, "failure: {detail}"),
            other => f.write_str(other.label()),
        }
    }
}
