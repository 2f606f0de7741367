//! Worker: the claim / execute / retire loop.
//!
//! Each worker runs one dispatcher task. Every pass of the dispatcher is a
//! tick: reclaim stalled jobs, then claim until the concurrency budget is
//! used up, handing each claimed job to a slot in a bounded `JoinSet`. When
//! nothing is claimable and nothing is in flight the dispatcher reports
//! `Drained` (once per transition) and waits out the poll interval.
//!
//! Lifecycle lives in a `watch` channel, notifications in a separate
//! broadcast channel (see [`crate::event`]):
//!
//! ```text
//! Idle ──start──▶ Running ──stop──▶ Draining ──last slot free──▶ Stopped
//!                    ▲                  │                          │
//!                    └──────start───────┘◀──────────start──────────┘
//! ```

pub mod command;
pub(crate) mod executor;
pub mod handler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{EventBus, WorkerEvent};
use crate::model::job::Job;
use crate::selector::{JobFilter, QueueSelector};
use crate::store::{ClaimRequest, JobStore};
use crate::telemetry::metrics;

use executor::Executor;
pub use command::CommandHandler;
pub use handler::{Handler, HandlerError, HandlerResult};

/// Default pause between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Upper bound on jobs executing at once.
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    /// Recorded as `owner_name` on claimed jobs. Defaults to
    /// `<selector>@<hostname>`.
    pub name: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            name: None,
        }
    }
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Never started.
    Idle,
    Running,
    /// Stop requested; in-flight jobs are finishing.
    Draining,
    Stopped,
}

/// Handle to a worker. Clones share the same loop.
///
/// Dropping the last handle without calling [`Worker::stop`] aborts the
/// loop; jobs it had in flight are left to stall recovery.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
    dispatcher: Arc<DispatcherHandle>,
}

/// Abort handle of the running dispatcher, shared by all `Worker` clones.
#[derive(Default)]
struct DispatcherHandle(Mutex<Option<AbortHandle>>);

impl DispatcherHandle {
    fn replace(&self, handle: AbortHandle) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(handle);
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.0.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

struct Inner {
    store: Arc<dyn JobStore>,
    filter: JobFilter,
    name: String,
    max_concurrency: usize,
    poll_interval: Duration,
    executor: Arc<Executor>,
    events: EventBus,
    state: watch::Sender<WorkerState>,
    /// Whether `Drained` was the last work-availability transition reported.
    drained: AtomicBool,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        selector: QueueSelector,
        handler: impl Handler,
        options: WorkerOptions,
    ) -> Result<Self> {
        Self::with_handler(store, selector, Arc::new(handler), options)
    }

    pub fn with_handler(
        store: Arc<dyn JobStore>,
        selector: QueueSelector,
        handler: Arc<dyn Handler>,
        options: WorkerOptions,
    ) -> Result<Self> {
        if options.max_concurrency == 0 {
            return Err(Error::InvalidArgument(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if options.poll_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "poll interval must be positive".to_string(),
            ));
        }

        let name = match options.name {
            Some(name) if !name.is_empty() => name,
            Some(_) => {
                return Err(Error::InvalidArgument("worker name is empty".to_string()));
            }
            None => default_name(&selector),
        };
        let filter = selector.into_filter()?;
        let events = EventBus::new();
        let (state, _) = watch::channel(WorkerState::Idle);

        let executor = Arc::new(Executor {
            store: Arc::clone(&store),
            handler,
            events: events.clone(),
            worker_name: name.clone(),
        });

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                filter,
                name,
                max_concurrency: options.max_concurrency,
                poll_interval: options.poll_interval,
                executor,
                events,
                state,
                drained: AtomicBool::new(false),
            }),
            dispatcher: Arc::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The compiled selector this worker claims with.
    pub fn filter(&self) -> &JobFilter {
        &self.inner.filter
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    /// Subscribe to this worker's events. Only events sent after the call
    /// are observed.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Start claiming work. Idempotent; `Started` has been published by the
    /// time this returns. Restarting a draining worker cancels the pending
    /// stop. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("worker requires a tokio runtime: {e}")))?;

        let mut previous = WorkerState::Running;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            if *state == WorkerState::Running {
                return false;
            }
            *state = WorkerState::Running;
            self.inner.events.emit(WorkerEvent::Started);
            true
        });

        match previous {
            WorkerState::Running => {}
            WorkerState::Draining => {
                info!(worker = %self.inner.name, "worker resumed before stopping");
            }
            WorkerState::Idle | WorkerState::Stopped => {
                info!(
                    worker = %self.inner.name,
                    max_concurrency = self.inner.max_concurrency,
                    "worker started"
                );
                let task = runtime.spawn(Arc::clone(&self.inner).dispatch());
                self.dispatcher.replace(task.abort_handle());
            }
        }
        Ok(())
    }

    /// Stop claiming work and wait for in-flight jobs to retire. Returns once
    /// `Stopped` has been published, or early if the worker is started again
    /// meanwhile. In-flight work functions are not cancelled.
    pub async fn stop(&self) {
        let mut rx = self.inner.state.subscribe();
        let mut wait = false;
        self.inner.state.send_if_modified(|state| match *state {
            WorkerState::Running => {
                *state = WorkerState::Draining;
                wait = true;
                true
            }
            WorkerState::Draining => {
                wait = true;
                false
            }
            WorkerState::Idle | WorkerState::Stopped => {
                *state = WorkerState::Stopped;
                self.inner.events.emit(WorkerEvent::Stopped);
                true
            }
        });

        if wait {
            info!(worker = %self.inner.name, "worker stopping");
            let _ = rx
                .wait_for(|s| matches!(s, WorkerState::Stopped | WorkerState::Running))
                .await;
        }
    }
}

fn default_name(selector: &QueueSelector) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{host}", selector.label())
}

impl Inner {
    fn is_running(&self) -> bool {
        *self.state.borrow() == WorkerState::Running
    }

    /// The dispatcher loop. Exits after publishing `Stopped`.
    async fn dispatch(self: Arc<Self>) {
        let mut state_rx = self.state.subscribe();
        let mut slots: JoinSet<()> = JoinSet::new();

        loop {
            let state = *state_rx.borrow_and_update();
            if state != WorkerState::Running {
                if slots.is_empty() {
                    if self.finish_stop() {
                        break;
                    }
                    // Restarted between the check and the transition.
                    continue;
                }
                tokio::select! {
                    Some(done) = slots.join_next() => self.reap(done),
                    _ = state_rx.changed() => {}
                }
                continue;
            }

            self.reclaim_stalled().await;

            let mut found_none = false;
            while slots.len() < self.max_concurrency && self.is_running() {
                match self.claim().await {
                    Ok(Some(job)) => {
                        self.drained.store(false, Ordering::Relaxed);
                        let executor = Arc::clone(&self.executor);
                        slots.spawn(async move { executor.execute(job).await });
                    }
                    Ok(None) => {
                        found_none = true;
                        break;
                    }
                    Err(e) => {
                        self.store_error("claim", e);
                        break;
                    }
                }
            }

            if slots.is_empty() {
                if found_none && !self.drained.swap(true, Ordering::Relaxed) {
                    debug!(worker = %self.name, "no claimable work");
                    self.events.emit(WorkerEvent::Drained);
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = state_rx.changed() => {}
                }
            } else {
                let has_free_slot = slots.len() < self.max_concurrency;
                tokio::select! {
                    Some(done) = slots.join_next() => self.reap(done),
                    _ = tokio::time::sleep(self.poll_interval), if has_free_slot => {}
                    _ = state_rx.changed() => {}
                }
            }
        }

        info!(worker = %self.name, "worker stopped");
    }

    /// Draining → Stopped, publishing `Stopped` atomically with the
    /// transition. False if the worker was restarted instead.
    fn finish_stop(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state != WorkerState::Draining {
                return false;
            }
            *state = WorkerState::Stopped;
            self.events.emit(WorkerEvent::Stopped);
            true
        })
    }

    async fn claim(&self) -> Result<Option<Job>> {
        let request = ClaimRequest::new(self.name.clone());
        let job = self.store.claim_one(&self.filter, &request).await?;

        if let Some(ref job) = job {
            metrics::jobs_claimed().add(1, &[KeyValue::new("worker", self.name.clone())]);
            debug!(
                worker = %self.name,
                id = %job.id,
                queue = %job.queue_name,
                attempt = job.attempts_used,
                "job claimed"
            );
            self.events.emit(WorkerEvent::JobClaimed {
                id: job.id.clone(),
                attempt: job.attempts_used,
            });
        }
        Ok(job)
    }

    async fn reclaim_stalled(&self) {
        match self.store.reclaim_stalled(&self.filter).await {
            Ok(0) => {}
            Ok(count) => {
                metrics::jobs_stalled().add(count, &[KeyValue::new("worker", self.name.clone())]);
                warn!(worker = %self.name, count, "reclaimed stalled jobs");
                self.events.emit(WorkerEvent::Stalled { count });
            }
            Err(e) => self.store_error("reclaim", e),
        }
    }

    fn reap(&self, done: std::result::Result<(), JoinError>) {
        if let Err(e) = done {
            warn!(worker = %self.name, error = %e, "job slot panicked");
            self.events
                .error(Error::Other(format!("job slot panicked: {e}")));
        }
    }

    fn store_error(&self, operation: &'static str, e: Error) {
        metrics::store_errors().add(1, &[KeyValue::new("operation", operation)]);
        warn!(worker = %self.name, operation, error = %e, "store operation failed");
        self.events.error(e);
    }
}
