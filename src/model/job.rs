//! Job data model.
//!
//! A job is a unit of work tagged with a queue name, a priority and a retry
//! budget. It is the only persisted entity; every store keeps the same field
//! set so documents stay interchangeable between backends.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default execution timeout applied when the caller does not set one.
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 5000;

/// Default retry budget: a single attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Longest accepted execution timeout (about 24.8 days). Every store can add
/// this to the current time without overflowing.
pub const MAX_EXECUTION_TIMEOUT_MS: u64 = i32::MAX as u64;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job document as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique, immutable after the first insert.
    pub id: JobId,

    pub queue_name: String,

    /// Opaque to the engine.
    pub payload: serde_json::Value,

    /// Higher is served first.
    pub priority: i32,

    pub execution_timeout_ms: u64,

    /// Incremented once per successful claim.
    pub attempts_used: u32,

    pub max_attempts: u32,

    pub status: Status,

    /// Set on first insert only.
    pub enqueued_at: DateTime<Utc>,

    pub dequeued_at: Option<DateTime<Utc>>,

    /// Only meaningful while dequeued.
    pub stall_deadline: Option<DateTime<Utc>>,

    /// Present iff the job is dequeued.
    pub owner_token: Option<OwnerToken>,

    pub owner_name: Option<String>,

    /// Present iff completed.
    pub result: Option<serde_json::Value>,

    /// Present iff failed, or re-enqueued after a failure.
    pub error_info: Option<ErrorInfo>,

    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Deadline for a single run of the work function.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Where a failed attempt sends the job: back to the queue while budget
    /// remains, otherwise to `Failed`.
    pub fn status_after_failure(&self) -> Status {
        if self.attempts_used < self.max_attempts {
            Status::Enqueued
        } else {
            Status::Failed
        }
    }

    pub fn is_claimable(&self) -> bool {
        self.status == Status::Enqueued
    }
}

/// Job identifier. Caller-supplied or a random UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Proof of the current claim. Fresh for every claim, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(pub Uuid);

impl OwnerToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be claimed.
    Enqueued,
    /// Owned by a worker.
    Dequeued,
    Completed,
    /// Retry budget exhausted.
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Enqueued => "enqueued",
            Status::Dequeued => "dequeued",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enqueued" => Ok(Status::Enqueued),
            "dequeued" => Ok(Status::Dequeued),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(Error::InvalidArgument(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Error info
// ---------------------------------------------------------------------------

/// Failure details recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    /// Rendered `source()` chain, outermost cause first.
    pub trace: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    /// Capture an error and the chain of causes behind it.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            trace: if causes.is_empty() {
                None
            } else {
                Some(causes.join("\ncaused by: "))
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Options for [`crate::queue::Queue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub(crate) id: Option<JobId>,
    pub(crate) priority: i32,
    pub(crate) execution_timeout_ms: u64,
    pub(crate) max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            id: None,
            priority: 0,
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn execution_timeout_ms(mut self, ms: u64) -> Self {
        self.execution_timeout_ms = ms;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidArgument(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.execution_timeout_ms == 0 {
            return Err(Error::InvalidArgument(
                "execution timeout must be positive".to_string(),
            ));
        }
        if self.execution_timeout_ms > MAX_EXECUTION_TIMEOUT_MS {
            return Err(Error::InvalidArgument(format!(
                "execution timeout must not exceed {MAX_EXECUTION_TIMEOUT_MS} ms"
            )));
        }
        if self.id.as_ref().is_some_and(|id| id.0.is_empty()) {
            return Err(Error::InvalidArgument("job id must not be empty".to_string()));
        }
        Ok(())
    }
}
