//! Events emitted by a worker.
//!
//! The scheduling loop publishes on a broadcast channel; any number of
//! consumers subscribe independently of whether the worker is running.
//! Background failures surface here and nowhere else.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::Error;
use crate::model::job::{JobId, Status};

/// Capacity of the per-worker event channel. Slow subscribers that fall
/// further behind than this observe `RecvError::Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The loop moved to running.
    Started,
    /// The loop stopped and nothing is in flight.
    Stopped,
    /// No claimable work and nothing in flight. Once per transition.
    Drained,
    /// Overdue jobs were returned to the queue.
    Stalled { count: u64 },
    JobClaimed { id: JobId, attempt: u32 },
    JobRetired { id: JobId, status: Status },
    /// A loop phase failed. The loop keeps going.
    Error(Arc<Error>),
}

/// Sending half of a worker's event channel.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn error(&self, err: Error) {
        self.emit(WorkerEvent::Error(Arc::new(err)));
    }
}
