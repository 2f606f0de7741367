//! Runs a claimed job and retires it.
//!
//! Retirement is conditioned on the owner token the claim assigned. A run
//! that outlives its deadline is abandoned, not cancelled; whatever it
//! eventually produces is never written because the token check fails first.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, info, warn};

use super::handler::Handler;
use crate::error::{Error, Result};
use crate::event::{EventBus, WorkerEvent};
use crate::model::job::{ErrorInfo, Job};
use crate::store::{JobStore, Retirement};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

pub(crate) struct Executor {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) events: EventBus,
    pub(crate) worker_name: String,
}

impl Executor {
    /// Run the work function and retire the job. Never fails: problems are
    /// published as error events.
    pub(crate) async fn execute(&self, job: Job) {
        let span = start_job_span(&job.queue_name, &job.id, &self.worker_name, job.attempts_used);

        async {
            if let Err(e) = self.run(&job, &span).await {
                if e.is_store_fault() {
                    metrics::store_errors().add(1, &[KeyValue::new("operation", "retire")]);
                }
                let status = match e {
                    Error::LostOwnership { .. } => "lost",
                    _ => "error",
                };
                metrics::jobs_retired().add(
                    1,
                    &[
                        KeyValue::new("worker", self.worker_name.clone()),
                        KeyValue::new("status", status),
                    ],
                );
                warn!(id = %job.id, error = %e, "retirement failed");
                self.events.error(e);
            }
        }
        .instrument(span.clone())
        .await
    }

    async fn run(&self, job: &Job, span: &Span) -> Result<()> {
        let token = job
            .owner_token
            .ok_or_else(|| Error::Other(format!("claimed job {} carries no owner token", job.id)))?;

        let retirement = match self.invoke(job).await {
            Ok(result) => Retirement::Completed { result },
            Err(error) => {
                debug!(id = %job.id, error = %error.message, "attempt failed");
                Retirement::Failed {
                    status: job.status_after_failure(),
                    error,
                }
            }
        };
        let status = retirement.status();

        let Some(retired) = self.store.retire(&token, &retirement).await? else {
            return Err(Error::LostOwnership { token });
        };

        record_state_transition(span, "dequeued", status.as_str());
        if status.is_terminal() {
            info!(id = %retired.id, status = %status, attempts = retired.attempts_used, "job finished");
        } else {
            debug!(id = %retired.id, attempts = retired.attempts_used, "job returned to queue");
        }
        metrics::jobs_retired().add(
            1,
            &[
                KeyValue::new("worker", self.worker_name.clone()),
                KeyValue::new("status", status.as_str()),
            ],
        );
        self.events.emit(WorkerEvent::JobRetired {
            id: retired.id,
            status,
        });
        Ok(())
    }

    /// Race the work function against the job's deadline.
    async fn invoke(&self, job: &Job) -> std::result::Result<serde_json::Value, ErrorInfo> {
        let start = Instant::now();
        // Spawned so that hitting the deadline detaches the run instead of
        // dropping it mid-flight.
        let run = tokio::spawn(self.handler.call(job.payload.clone()));
        let outcome = tokio::time::timeout(job.execution_timeout(), run).await;

        let (label, result) = match outcome {
            Ok(Ok(Ok(value))) => ("ok", Ok(value)),
            Ok(Ok(Err(e))) => ("error", Err(ErrorInfo::from_error(&*e))),
            Ok(Err(join_err)) => (
                "error",
                Err(ErrorInfo::new(format!("work function panicked: {join_err}"))),
            ),
            Err(_) => {
                let timeout = Error::ExecutionTimeout {
                    timeout_ms: job.execution_timeout_ms,
                };
                ("timeout", Err(ErrorInfo::from_error(&timeout)))
            }
        };

        metrics::job_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("queue", job.queue_name.clone()),
                KeyValue::new("outcome", label),
            ],
        );
        result
    }
}
