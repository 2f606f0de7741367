//! Job execution span helpers.

use tracing::Span;

use crate::model::job::JobId;

/// Start a span covering one claimed attempt of a job.
///
/// The `job.status` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(queue: &str, job_id: &JobId, worker: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.queue" = queue,
        "job.id" = %job_id,
        "job.worker" = worker,
        "job.attempt" = attempt,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit it as an `info` event.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
