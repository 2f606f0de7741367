//! PostgreSQL job store via direct SQLx.
//!
//! Every primitive is one statement, so atomicity comes from Postgres row
//! locking: claims use `FOR UPDATE SKIP LOCKED` inside an `UPDATE … RETURNING`,
//! enqueues use `ON CONFLICT … DO UPDATE … WHERE`, and retirement matches on
//! the owner token. Times are taken from the database clock.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::{ClaimRequest, JobStore, JobUpsert, ListQuery, Retirement, Upsert};
use crate::error::{Error, Result};
use crate::model::job::{ErrorInfo, Job, JobId, OwnerToken, Status};
use crate::selector::JobFilter;

const JOB_COLUMNS: &str = "id, queue_name, payload, priority, execution_timeout_ms, \
     attempts_used, max_attempts, status, enqueued_at, dequeued_at, stall_deadline, \
     owner_token, owner_name, result, error_info, completed_at, failed_at";

/// Postgres-backed store. Owns the connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Migration(e.to_string()))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// SQL predicate for a [`JobFilter`], using three consecutive bind slots
/// starting at `$first`.
fn filter_clause(first: usize) -> String {
    format!(
        "(${a}::text[] IS NULL OR queue_name = ANY(${a})) \
         AND (${b}::jsonb IS NULL OR payload @> ${b}) \
         AND (${c}::int4 IS NULL OR priority >= ${c})",
        a = first,
        b = first + 1,
        c = first + 2,
    )
}

fn to_i32(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::InvalidArgument(format!("{field} out of range")))
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidArgument(format!("{field} out of range")))
}

#[async_trait]
impl JobStore for PgStore {
    async fn upsert_if_claimable(&self, job: &JobUpsert) -> Result<Upsert> {
        // The WHERE on the conflict arm turns "exists but not enqueued" into
        // zero returned rows instead of an overwrite.
        let sql = format!(
            "INSERT INTO jobs (id, queue_name, payload, priority, execution_timeout_ms, attempts_used, max_attempts, status, enqueued_at)
             VALUES ($1, $2, $3, $4, $5, 0, $6, 'enqueued', clock_timestamp())
             ON CONFLICT (id) DO UPDATE SET
                 queue_name = EXCLUDED.queue_name,
                 payload = EXCLUDED.payload,
                 priority = EXCLUDED.priority,
                 execution_timeout_ms = EXCLUDED.execution_timeout_ms,
                 attempts_used = 0,
                 max_attempts = EXCLUDED.max_attempts
             WHERE jobs.status = 'enqueued'
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job.id.as_str())
            .bind(&job.queue_name)
            .bind(&job.payload)
            .bind(job.priority)
            .bind(to_i64(job.execution_timeout_ms, "execution_timeout_ms")?)
            .bind(to_i32(job.max_attempts, "max_attempts")?)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Upsert::Written(Box::new(row.try_into_job()?))),
            None => Ok(Upsert::Conflict),
        }
    }

    async fn claim_one(&self, filter: &JobFilter, claim: &ClaimRequest) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE jobs SET
                 status = 'dequeued',
                 dequeued_at = now(),
                 stall_deadline = now() + execution_timeout_ms * interval '1 millisecond',
                 attempts_used = attempts_used + 1,
                 owner_token = $1,
                 owner_name = $2
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'enqueued' AND {filter}
                 ORDER BY priority DESC, enqueued_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}",
            filter = filter_clause(3),
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(claim.token.0)
            .bind(&claim.owner_name)
            .bind(filter.queues.clone())
            .bind(filter.payload.clone())
            .bind(filter.min_priority)
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRow::try_into_job).transpose()
    }

    async fn retire(&self, token: &OwnerToken, retirement: &Retirement) -> Result<Option<Job>> {
        let row: Option<JobRow> = match retirement {
            Retirement::Completed { result } => {
                let sql = format!(
                    "UPDATE jobs SET
                         status = 'completed',
                         result = $2,
                         completed_at = now(),
                         owner_token = NULL,
                         stall_deadline = NULL
                     WHERE owner_token = $1
                     RETURNING {JOB_COLUMNS}"
                );
                sqlx::query_as(&sql)
                    .bind(token.0)
                    .bind(result)
                    .fetch_optional(&self.pool)
                    .await?
            }
            Retirement::Failed { status, error } => {
                let error = serde_json::to_value(error)
                    .map_err(|e| Error::Other(format!("serialize error info: {e}")))?;
                let sql = format!(
                    "UPDATE jobs SET
                         status = $2,
                         error_info = $3,
                         failed_at = now(),
                         owner_token = NULL,
                         stall_deadline = NULL
                     WHERE owner_token = $1
                     RETURNING {JOB_COLUMNS}"
                );
                sqlx::query_as(&sql)
                    .bind(token.0)
                    .bind(status.as_str())
                    .bind(error)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        row.map(JobRow::try_into_job).transpose()
    }

    async fn reclaim_stalled(&self, filter: &JobFilter) -> Result<u64> {
        let sql = format!(
            "UPDATE jobs SET
                 status = 'enqueued',
                 owner_token = NULL,
                 stall_deadline = NULL,
                 attempts_used = GREATEST(attempts_used - 1, 0)
             WHERE status = 'dequeued' AND stall_deadline < now() AND {filter}",
            filter = filter_clause(1),
        );
        let rows_affected = sqlx::query(&sql)
            .bind(filter.queues.clone())
            .bind(filter.payload.clone())
            .bind(filter.min_priority)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR queue_name = $2)
             ORDER BY priority DESC, enqueued_at ASC
             LIMIT $3"
        );
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(query.status.map(Status::as_str))
            .bind(query.queue.as_deref())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    queue_name: String,
    payload: serde_json::Value,
    priority: i32,
    execution_timeout_ms: i64,
    attempts_used: i32,
    max_attempts: i32,
    status: String,
    enqueued_at: chrono::DateTime<chrono::Utc>,
    dequeued_at: Option<chrono::DateTime<chrono::Utc>>,
    stall_deadline: Option<chrono::DateTime<chrono::Utc>>,
    owner_token: Option<Uuid>,
    owner_name: Option<String>,
    result: Option<serde_json::Value>,
    error_info: Option<serde_json::Value>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    failed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        let error_info = self
            .error_info
            .map(serde_json::from_value::<ErrorInfo>)
            .transpose()
            .map_err(|e| Error::Other(format!("bad error_info on job {}: {e}", self.id)))?;
        let out_of_range = |field: &str| Error::Other(format!("{field} out of range on job"));

        Ok(Job {
            status: self.status.parse()?,
            execution_timeout_ms: u64::try_from(self.execution_timeout_ms)
                .map_err(|_| out_of_range("execution_timeout_ms"))?,
            attempts_used: u32::try_from(self.attempts_used)
                .map_err(|_| out_of_range("attempts_used"))?,
            max_attempts: u32::try_from(self.max_attempts)
                .map_err(|_| out_of_range("max_attempts"))?,
            id: JobId(self.id),
            queue_name: self.queue_name,
            payload: self.payload,
            priority: self.priority,
            enqueued_at: self.enqueued_at,
            dequeued_at: self.dequeued_at,
            stall_deadline: self.stall_deadline,
            owner_token: self.owner_token.map(OwnerToken),
            owner_name: self.owner_name,
            result: self.result,
            error_info,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
        })
    }
}
