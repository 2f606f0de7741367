//! Metric instrument factories for jobq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: enqueue calls.
/// Labels: `queue`, `result` ("ok" | "duplicate" | "error").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.enqueued")
        .with_description("Number of enqueue calls")
        .build()
}

/// Counter: successful claims.
/// Labels: `worker`.
pub fn jobs_claimed() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.claimed")
        .with_description("Number of jobs claimed")
        .build()
}

/// Counter: retirements written.
/// Labels: `worker`, `status` ("completed" | "enqueued" | "failed" | "lost").
pub fn jobs_retired() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.retired")
        .with_description("Number of job retirements")
        .build()
}

/// Counter: jobs returned to the queue after their stall deadline.
/// Labels: `worker`.
pub fn jobs_stalled() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.stalled")
        .with_description("Number of stalled jobs reclaimed")
        .build()
}

/// Counter: store operations that failed.
/// Labels: `operation` ("enqueue" | "claim" | "retire" | "reclaim").
pub fn store_errors() -> Counter<u64> {
    meter()
        .u64_counter("jobq.store.errors")
        .with_description("Number of failed store operations")
        .build()
}

/// Histogram: work function duration in milliseconds.
/// Labels: `queue`, `outcome` ("ok" | "error" | "timeout").
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.job.duration_ms")
        .with_description("Work function duration in milliseconds")
        .with_unit("ms")
        .build()
}
