//! Atomic job storage.
//!
//! The store is the only shared mutable resource. Every mutation the engine
//! makes goes through one of four atomic primitives, so all lock discipline
//! lives in the backend's own concurrency control:
//!
//! - `upsert_if_claimable`: create, or refresh a job that is still enqueued
//! - `claim_one`: select the best enqueued job and take ownership of it
//! - `retire`: write an outcome, only while the owner token still matches
//! - `reclaim_stalled`: return every overdue dequeued job to the queue

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::job::{ErrorInfo, Job, JobId, OwnerToken, Status};
use crate::selector::JobFilter;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Mutable fields written by an enqueue. `enqueued_at` is assigned by the
/// store on insert and left alone on update.
#[derive(Debug, Clone)]
pub struct JobUpsert {
    pub id: JobId,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub execution_timeout_ms: u64,
    pub max_attempts: u32,
}

/// Outcome of [`JobStore::upsert_if_claimable`].
#[derive(Debug)]
pub enum Upsert {
    /// Inserted or refreshed; the post-update document.
    Written(Box<Job>),
    /// A job with that id exists but is not enqueued. Nothing was written.
    Conflict,
}

/// Identity stamped on a job by a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub token: OwnerToken,
    pub owner_name: String,
}

impl ClaimRequest {
    pub fn new(owner_name: impl Into<String>) -> Self {
        Self {
            token: OwnerToken::new(),
            owner_name: owner_name.into(),
        }
    }
}

/// Terminal write for a claimed job.
#[derive(Debug, Clone)]
pub enum Retirement {
    Completed { result: serde_json::Value },
    /// `status` is `Enqueued` for a retry or `Failed` once the budget is spent.
    Failed { status: Status, error: ErrorInfo },
}

impl Retirement {
    pub fn status(&self) -> Status {
        match self {
            Retirement::Completed { .. } => Status::Completed,
            Retirement::Failed { status, .. } => *status,
        }
    }
}

/// Read-side query used by tooling.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub status: Option<Status>,
    pub queue: Option<String>,
    pub limit: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            queue: None,
            limit: 100,
        }
    }
}

/// Contract every backing store provides.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Match on `id` and `status = enqueued`; set the mutable fields, reset
    /// `attempts_used`, and insert when no document has that id.
    async fn upsert_if_claimable(&self, job: &JobUpsert) -> Result<Upsert>;

    /// Atomically pick one enqueued job matching `filter`, highest priority
    /// first then oldest first, and transition it to dequeued: stamp
    /// `dequeued_at`, set `stall_deadline` from the job's own timeout,
    /// increment `attempts_used`, assign the claim's token and owner name.
    async fn claim_one(&self, filter: &JobFilter, claim: &ClaimRequest) -> Result<Option<Job>>;

    /// Apply `retirement` to the job owned by `token`, clearing the token and
    /// stall deadline. `None` when no job holds that token any more.
    async fn retire(&self, token: &OwnerToken, retirement: &Retirement) -> Result<Option<Job>>;

    /// Return every dequeued job matching `filter` whose stall deadline has
    /// passed to enqueued, giving back the attempt its claim consumed.
    /// Returns the number of jobs reclaimed.
    async fn reclaim_stalled(&self, filter: &JobFilter) -> Result<u64>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Jobs ordered like claims: priority descending, then oldest first.
    async fn list(&self, query: &ListQuery) -> Result<Vec<Job>>;
}
