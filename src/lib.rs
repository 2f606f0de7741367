//! # jobq
//!
//! Job queue over an atomic document store. Producers enqueue jobs tagged
//! with a queue name, priority and retry budget; workers claim, execute and
//! retire them with a single active owner per job, automatic stall recovery
//! and bounded per-worker concurrency.
//!
//! Delivery is at-least-once: a job whose owner misses its stall deadline is
//! returned to the queue, and the late owner's retirement is rejected by the
//! owner-token check.

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod selector;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
pub use event::WorkerEvent;
pub use model::job::{EnqueueOptions, ErrorInfo, Job, JobId, OwnerToken, Status};
pub use queue::Queue;
pub use selector::{JobFilter, QueueSelector};
pub use store::{JobStore, MemoryStore, PgStore};
pub use worker::{Handler, HandlerError, Worker, WorkerOptions, WorkerState};
