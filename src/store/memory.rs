//! In-process job store.
//!
//! One mutex guards the whole collection, so each trait call is a single
//! atomic step. Suitable for tests and for embedding the engine where all
//! workers live in one process.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use super::{ClaimRequest, JobStore, JobUpsert, ListQuery, Retirement, Upsert};
use crate::error::{Error, Result};
use crate::model::job::{Job, JobId, OwnerToken, Status};
use crate::selector::JobFilter;

#[derive(Default)]
struct Collection {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

/// Insertion sequence breaks ties between equal `enqueued_at` stamps.
struct Entry {
    seq: u64,
    job: Job,
}

/// Shared in-memory collection. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Collection>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store mutex poisoned".to_string()))
    }

    /// Edit a stored job out of band, bypassing the protocol. Returns false
    /// when no job has that id.
    pub fn modify(&self, id: &JobId, f: impl FnOnce(&mut Job)) -> Result<bool> {
        let mut coll = self.lock()?;
        match coll.jobs.get_mut(id) {
            Some(entry) => {
                f(&mut entry.job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.jobs.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.jobs.is_empty())
    }
}

fn claim_order(entry: &Entry) -> (Reverse<i32>, chrono::DateTime<Utc>, u64) {
    (Reverse(entry.job.priority), entry.job.enqueued_at, entry.seq)
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_if_claimable(&self, new: &JobUpsert) -> Result<Upsert> {
        let mut coll = self.lock()?;

        if let Some(entry) = coll.jobs.get_mut(&new.id) {
            if !entry.job.is_claimable() {
                return Ok(Upsert::Conflict);
            }
            let job = &mut entry.job;
            job.queue_name = new.queue_name.clone();
            job.payload = new.payload.clone();
            job.priority = new.priority;
            job.execution_timeout_ms = new.execution_timeout_ms;
            job.attempts_used = 0;
            job.max_attempts = new.max_attempts;
            return Ok(Upsert::Written(Box::new(job.clone())));
        }

        let job = Job {
            id: new.id.clone(),
            queue_name: new.queue_name.clone(),
            payload: new.payload.clone(),
            priority: new.priority,
            execution_timeout_ms: new.execution_timeout_ms,
            attempts_used: 0,
            max_attempts: new.max_attempts,
            status: Status::Enqueued,
            enqueued_at: Utc::now(),
            dequeued_at: None,
            stall_deadline: None,
            owner_token: None,
            owner_name: None,
            result: None,
            error_info: None,
            completed_at: None,
            failed_at: None,
        };
        let seq = coll.next_seq;
        coll.next_seq += 1;
        coll.jobs.insert(
            new.id.clone(),
            Entry {
                seq,
                job: job.clone(),
            },
        );
        Ok(Upsert::Written(Box::new(job)))
    }

    async fn claim_one(&self, filter: &JobFilter, claim: &ClaimRequest) -> Result<Option<Job>> {
        let mut coll = self.lock()?;

        let Some(entry) = coll
            .jobs
            .values_mut()
            .filter(|e| e.job.is_claimable() && filter.matches(&e.job))
            .min_by_key(|e| claim_order(e))
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let deadline = i64::try_from(entry.job.execution_timeout_ms)
            .ok()
            .and_then(ChronoDuration::try_milliseconds)
            .and_then(|t| now.checked_add_signed(t))
            .ok_or_else(|| {
                Error::Other(format!(
                    "job {} has an unrepresentable stall deadline ({} ms)",
                    entry.job.id, entry.job.execution_timeout_ms
                ))
            })?;
        let job = &mut entry.job;
        job.status = Status::Dequeued;
        job.dequeued_at = Some(now);
        job.stall_deadline = Some(deadline);
        job.attempts_used = job.attempts_used.saturating_add(1);
        job.owner_token = Some(claim.token);
        job.owner_name = Some(claim.owner_name.clone());
        Ok(Some(job.clone()))
    }

    async fn retire(&self, token: &OwnerToken, retirement: &Retirement) -> Result<Option<Job>> {
        let mut coll = self.lock()?;

        let Some(entry) = coll
            .jobs
            .values_mut()
            .find(|e| e.job.owner_token.as_ref() == Some(token))
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let job = &mut entry.job;
        match retirement {
            Retirement::Completed { result } => {
                job.status = Status::Completed;
                job.result = Some(result.clone());
                job.completed_at = Some(now);
            }
            Retirement::Failed { status, error } => {
                job.status = *status;
                job.error_info = Some(error.clone());
                job.failed_at = Some(now);
            }
        }
        job.owner_token = None;
        job.stall_deadline = None;
        Ok(Some(job.clone()))
    }

    async fn reclaim_stalled(&self, filter: &JobFilter) -> Result<u64> {
        let mut coll = self.lock()?;
        let now = Utc::now();

        let mut reclaimed = 0;
        for entry in coll.jobs.values_mut() {
            let job = &mut entry.job;
            let overdue = job.stall_deadline.is_some_and(|deadline| deadline < now);
            if job.status == Status::Dequeued && overdue && filter.matches(job) {
                job.status = Status::Enqueued;
                job.owner_token = None;
                job.stall_deadline = None;
                job.attempts_used = job.attempts_used.saturating_sub(1);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(id).map(|e| e.job.clone()))
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Job>> {
        let coll = self.lock()?;
        let mut entries: Vec<&Entry> = coll
            .jobs
            .values()
            .filter(|e| query.status.is_none_or(|s| e.job.status == s))
            .filter(|e| query.queue.as_ref().is_none_or(|q| *q == e.job.queue_name))
            .collect();
        entries.sort_by_key(|e| claim_order(e));
        Ok(entries
            .into_iter()
            .take(query.limit)
            .map(|e| e.job.clone())
            .collect())
    }
}
