//! Producer-facing API: enqueue jobs and build workers over one store.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::job::{EnqueueOptions, Job, JobId};
use crate::selector::QueueSelector;
use crate::store::{JobStore, JobUpsert, Upsert};
use crate::telemetry::metrics;
use crate::worker::{Handler, Worker, WorkerOptions};

/// Entry point for producers. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
}

impl Queue {
    pub fn new(store: impl JobStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_store(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a job, or refresh one that is still waiting to be claimed.
    ///
    /// Re-submitting an enqueued job replaces its mutable fields and resets
    /// its attempt count but keeps the original `enqueued_at`. Re-submitting
    /// a job that was already claimed, completed or failed is rejected with
    /// [`Error::DuplicateClaimedJob`].
    pub async fn enqueue(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Job> {
        if queue_name.is_empty() {
            return Err(Error::InvalidArgument("queue name is required".to_string()));
        }
        options.validate()?;

        let upsert = JobUpsert {
            id: options.id.unwrap_or_default(),
            queue_name: queue_name.to_string(),
            payload,
            priority: options.priority,
            execution_timeout_ms: options.execution_timeout_ms,
            max_attempts: options.max_attempts,
        };

        let outcome = match self.store.upsert_if_claimable(&upsert).await {
            Ok(outcome) => outcome,
            Err(e) => {
                record_enqueue(queue_name, "error");
                metrics::store_errors().add(1, &[KeyValue::new("operation", "enqueue")]);
                return Err(e);
            }
        };

        match outcome {
            Upsert::Written(job) => {
                record_enqueue(queue_name, "ok");
                info!(
                    id = %job.id,
                    queue = %job.queue_name,
                    priority = job.priority,
                    max_attempts = job.max_attempts,
                    "job enqueued"
                );
                Ok(*job)
            }
            Upsert::Conflict => {
                record_enqueue(queue_name, "duplicate");
                warn!(id = %upsert.id, queue = queue_name, "job is no longer enqueued");
                Err(Error::DuplicateClaimedJob { id: upsert.id })
            }
        }
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    /// Build a worker over this queue's store.
    pub fn worker(
        &self,
        selector: impl Into<QueueSelector>,
        handler: impl Handler,
        options: WorkerOptions,
    ) -> Result<Worker> {
        Worker::new(Arc::clone(&self.store), selector.into(), handler, options)
    }
}

fn record_enqueue(queue: &str, result: &'static str) {
    metrics::jobs_enqueued().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("result", result),
        ],
    );
}
