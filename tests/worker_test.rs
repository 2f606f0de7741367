use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use jobq::store::{ClaimRequest, JobStore};
use jobq::{
    EnqueueOptions, Error, Handler, HandlerError, JobFilter, MemoryStore, OwnerToken, Queue, Status,
    Worker, WorkerEvent, WorkerOptions, WorkerState,
};
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore, broadcast};

const WAIT: Duration = Duration::from_secs(5);

fn setup() -> (Queue, MemoryStore) {
    let store = MemoryStore::new();
    (Queue::new(store.clone()), store)
}

fn fast() -> WorkerOptions {
    WorkerOptions::new()
        .poll_interval(Duration::from_millis(10))
        .name("test-worker")
}

/// Collect events until `done` says stop, failing after `WAIT`.
async fn collect_until(
    rx: &mut broadcast::Receiver<WorkerEvent>,
    mut done: impl FnMut(&[WorkerEvent]) -> bool,
) -> Vec<WorkerEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        while !done(&seen) {
            match rx.recv().await {
                Ok(event) => seen.push(event),
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for worker events");
    seen
}

fn retired(events: &[WorkerEvent]) -> Vec<(String, Status)> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::JobRetired { id, status } => Some((id.to_string(), *status)),
            _ => None,
        })
        .collect()
}

/// A handler recording the `name` field of every payload it sees.
fn recorder(log: Arc<Mutex<Vec<String>>>) -> impl Handler {
    move |payload: Value| {
        let log = Arc::clone(&log);
        async move {
            let name = payload["name"].as_str().unwrap_or_default().to_string();
            log.lock().unwrap().push(name);
            Ok::<_, HandlerError>(json!({"ok": true}))
        }
    }
}

#[tokio::test]
async fn completes_job_and_records_result() {
    let (queue, store) = setup();
    let job = queue
        .enqueue("emails", json!({"n": 2}), EnqueueOptions::new())
        .await
        .unwrap();

    let worker = queue
        .worker(
            "emails",
            |payload: Value| async move {
                let n = payload["n"].as_i64().unwrap_or_default();
                Ok::<_, HandlerError>(json!(n * 21))
            },
            fast(),
        )
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| !retired(seen).is_empty()).await;
    worker.stop().await;

    let done = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, Status::Completed);
    assert_eq!(done.result, Some(json!(42)));
    assert_eq!(done.attempts_used, 1);
    assert_eq!(done.owner_name.as_deref(), Some("test-worker"));
    assert!(done.owner_token.is_none());
    assert!(done.completed_at.is_some());
    assert!(done.dequeued_at.is_some());
}

#[tokio::test]
async fn only_claims_selected_queues() {
    let (queue, store) = setup();
    let a = queue.enqueue("a", json!({}), EnqueueOptions::new()).await.unwrap();
    let b = queue.enqueue("b", json!({}), EnqueueOptions::new()).await.unwrap();

    let worker = queue
        .worker("a", |_: Value| async { Ok::<_, HandlerError>(Value::Null) }, fast())
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| seen.iter().any(|e| matches!(e, WorkerEvent::Drained))).await;
    worker.stop().await;

    assert_eq!(store.get(&a.id).await.unwrap().unwrap().status, Status::Completed);
    assert_eq!(store.get(&b.id).await.unwrap().unwrap().status, Status::Enqueued);
}

#[tokio::test]
async fn claims_in_insertion_order_within_a_priority() {
    let (queue, _) = setup();
    for name in ["A", "B", "C"] {
        queue
            .enqueue("q", json!({"name": name}), EnqueueOptions::new())
            .await
            .unwrap();
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let worker = queue.worker("q", recorder(Arc::clone(&log)), fast()).unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| retired(seen).len() == 3).await;
    worker.stop().await;

    assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn claims_higher_priority_first() {
    let (queue, _) = setup();
    for (name, priority) in [("zero", 0), ("minus", -1), ("plus", 1)] {
        queue
            .enqueue(
                "q",
                json!({"name": name}),
                EnqueueOptions::new().priority(priority),
            )
            .await
            .unwrap();
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let worker = queue.worker("q", recorder(Arc::clone(&log)), fast()).unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| retired(seen).len() == 3).await;
    worker.stop().await;

    assert_eq!(*log.lock().unwrap(), vec!["plus", "zero", "minus"]);
}

#[tokio::test]
async fn failing_job_is_retried_until_attempts_run_out() {
    let (queue, store) = setup();
    let job = queue
        .enqueue("q", json!({}), EnqueueOptions::new().max_attempts(3))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let worker = queue
        .worker(
            "q",
            move |_: Value| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, HandlerError>("smtp unavailable".into())
                }
            },
            fast(),
        )
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    let events = collect_until(&mut rx, |seen| {
        retired(seen).iter().any(|(_, s)| *s == Status::Failed)
    })
    .await;
    worker.stop().await;

    let statuses: Vec<Status> = retired(&events).into_iter().map(|(_, s)| s).collect();
    assert_eq!(statuses, vec![Status::Enqueued, Status::Enqueued, Status::Failed]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let failed = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert_eq!(failed.attempts_used, 3);
    assert!(failed.failed_at.is_some());
    let error = failed.error_info.unwrap();
    assert_eq!(error.message, "smtp unavailable");
}

#[tokio::test(start_paused = true)]
async fn timed_out_job_counts_as_failed_attempt() {
    let (queue, store) = setup();
    let job = queue
        .enqueue(
            "q",
            json!({}),
            EnqueueOptions::new().execution_timeout_ms(20).max_attempts(2),
        )
        .await
        .unwrap();

    let worker = queue
        .worker(
            "q",
            |_: Value| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, HandlerError>(json!("too late"))
            },
            fast(),
        )
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    let events = collect_until(&mut rx, |seen| retired(seen).len() == 2).await;
    worker.stop().await;

    let statuses: Vec<Status> = retired(&events).into_iter().map(|(_, s)| s).collect();
    assert_eq!(statuses, vec![Status::Enqueued, Status::Failed]);

    let failed = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert!(failed.result.is_none());
    assert!(failed.error_info.unwrap().message.contains("20 ms"));
}

#[tokio::test]
async fn stalled_job_is_reclaimed_without_spending_an_attempt() {
    let (queue, store) = setup();
    let job = queue
        .enqueue("q", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    // A crashed worker claimed the job and never came back.
    store
        .claim_one(&JobFilter::default(), &ClaimRequest::new("crashed"))
        .await
        .unwrap()
        .unwrap();
    store
        .modify(&job.id, |j| {
            j.stall_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        })
        .unwrap();

    let worker = queue
        .worker("q", |_: Value| async { Ok::<_, HandlerError>(json!("done")) }, fast())
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    let events = collect_until(&mut rx, |seen| !retired(seen).is_empty()).await;
    worker.stop().await;

    let stalled: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Stalled { count } => Some(*count),
            _ => None,
        })
        .collect();
    assert_eq!(stalled, vec![1]);

    let done = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, Status::Completed);
    assert_eq!(done.attempts_used, 1);
    assert_eq!(done.owner_name.as_deref(), Some("test-worker"));
}

#[tokio::test(start_paused = true)]
async fn drained_is_reported_once_per_transition() {
    let (queue, _) = setup();
    let worker = queue
        .worker(
            "q",
            |_: Value| async { Ok::<_, HandlerError>(Value::Null) },
            WorkerOptions::new().poll_interval(Duration::from_millis(1)),
        )
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // New work flips the worker out of the drained state and back.
    queue.enqueue("q", json!({}), EnqueueOptions::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    worker.stop().await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let drained = events
        .iter()
        .filter(|e| matches!(e, WorkerEvent::Drained))
        .count();
    assert_eq!(drained, 2);
    assert_eq!(retired(&events).len(), 1);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let (queue, _) = setup();
    let worker = queue
        .worker("q", |_: Value| async { Ok::<_, HandlerError>(Value::Null) }, fast())
        .unwrap();
    let mut rx = worker.subscribe();
    assert_eq!(worker.state(), WorkerState::Idle);

    worker.start().unwrap();
    worker.start().unwrap();
    assert_eq!(worker.state(), WorkerState::Running);

    worker.stop().await;
    worker.stop().await;
    assert_eq!(worker.state(), WorkerState::Stopped);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let started = events.iter().filter(|e| matches!(e, WorkerEvent::Started)).count();
    let stopped = events.iter().filter(|e| matches!(e, WorkerEvent::Stopped)).count();
    assert_eq!(started, 1);
    // Stopping an already stopped worker reports Stopped again.
    assert_eq!(stopped, 2);
    assert!(matches!(events.last(), Some(WorkerEvent::Stopped)));
}

#[tokio::test]
async fn stop_waits_for_in_flight_jobs() {
    let (queue, store) = setup();
    let job = queue.enqueue("q", json!({}), EnqueueOptions::new()).await.unwrap();

    let worker = queue
        .worker(
            "q",
            |_: Value| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, HandlerError>(json!("finished"))
            },
            fast(),
        )
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| {
        seen.iter().any(|e| matches!(e, WorkerEvent::JobClaimed { .. }))
    })
    .await;

    worker.stop().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(store.get(&job.id).await.unwrap().unwrap().status, Status::Completed);

    let mut after_claim = Vec::new();
    while let Ok(event) = rx.try_recv() {
        after_claim.push(event);
    }
    let stopped: Vec<usize> = after_claim
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, WorkerEvent::Stopped))
        .map(|(i, _)| i)
        .collect();
    let retired_at = after_claim
        .iter()
        .position(|e| matches!(e, WorkerEvent::JobRetired { .. }))
        .expect("job retired before stop returned");
    assert_eq!(stopped.len(), 1, "{after_claim:?}");
    assert!(retired_at < stopped[0]);
}

#[tokio::test]
async fn start_while_draining_cancels_the_stop() {
    let (queue, store) = setup();
    queue.enqueue("q", json!({}), EnqueueOptions::new()).await.unwrap();

    let release = Arc::new(Semaphore::new(0));
    let gate = Arc::clone(&release);
    let worker = queue
        .worker(
            "q",
            move |_: Value| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.acquire().await?.forget();
                    Ok::<_, HandlerError>(Value::Null)
                }
            },
            fast(),
        )
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| {
        seen.iter().any(|e| matches!(e, WorkerEvent::JobClaimed { .. }))
    })
    .await;

    let stopping = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.stop().await })
    };
    tokio::time::timeout(WAIT, async {
        while worker.state() != WorkerState::Draining {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("worker never started draining");

    worker.start().unwrap();
    tokio::time::timeout(WAIT, stopping)
        .await
        .expect("stop kept waiting after restart")
        .unwrap();
    assert_eq!(worker.state(), WorkerState::Running);

    // Still claiming: the in-flight job finishes and new work is picked up.
    let second = queue.enqueue("q", json!({}), EnqueueOptions::new()).await.unwrap();
    release.add_permits(2);
    let events = collect_until(&mut rx, |seen| retired(seen).len() == 2).await;
    assert!(!events.iter().any(|e| matches!(e, WorkerEvent::Stopped)));
    assert_eq!(store.get(&second.id).await.unwrap().unwrap().status, Status::Completed);

    worker.stop().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn payload_and_priority_filters_select_jobs() {
    let (queue, store) = setup();
    let wanted = queue
        .enqueue("q", json!({"kind": "email", "to": 1}), EnqueueOptions::new().priority(2))
        .await
        .unwrap();
    let low = queue
        .enqueue("q", json!({"kind": "email", "to": 2}), EnqueueOptions::new())
        .await
        .unwrap();
    let other = queue
        .enqueue("q", json!({"kind": "sms"}), EnqueueOptions::new().priority(5))
        .await
        .unwrap();

    let filter = JobFilter::default()
        .payload_contains(json!({"kind": "email"}))
        .min_priority(1);
    let worker = queue
        .worker(filter, |_: Value| async { Ok::<_, HandlerError>(Value::Null) }, fast())
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| seen.iter().any(|e| matches!(e, WorkerEvent::Drained))).await;
    worker.stop().await;

    let status = |job: Option<jobq::Job>| job.map(|j| j.status);
    assert_eq!(status(store.get(&wanted.id).await.unwrap()), Some(Status::Completed));
    assert_eq!(status(store.get(&low.id).await.unwrap()), Some(Status::Enqueued));
    assert_eq!(status(store.get(&other.id).await.unwrap()), Some(Status::Enqueued));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_ends_the_loop() {
    let (queue, store) = setup();
    let worker = queue
        .worker("q", |_: Value| async { Ok::<_, HandlerError>(Value::Null) }, fast())
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| seen.iter().any(|e| matches!(e, WorkerEvent::Drained))).await;

    drop(worker);
    tokio::task::yield_now().await;

    let job = queue.enqueue("q", json!({}), EnqueueOptions::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.get(&job.id).await.unwrap().unwrap().status, Status::Enqueued);
}

#[tokio::test]
async fn late_retirement_after_ownership_change_is_rejected() {
    let (queue, store) = setup();
    let job = queue.enqueue("q", json!({}), EnqueueOptions::new()).await.unwrap();

    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    let worker = queue
        .worker(
            "q",
            move |_: Value| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok::<_, HandlerError>(json!("stale"))
                }
            },
            fast(),
        )
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| {
        seen.iter().any(|e| matches!(e, WorkerEvent::JobClaimed { .. }))
    })
    .await;

    // Someone else took the job over while the work function was running.
    let usurper = OwnerToken::new();
    store
        .modify(&job.id, |j| j.owner_token = Some(usurper))
        .unwrap();
    release.notify_one();

    let events = collect_until(&mut rx, |seen| {
        seen.iter().any(|e| matches!(e, WorkerEvent::Error(_)))
    })
    .await;
    worker.stop().await;

    let lost = events.iter().any(|e| {
        matches!(e, WorkerEvent::Error(err) if matches!(**err, Error::LostOwnership { .. }))
    });
    assert!(lost, "expected LostOwnership, got {events:?}");

    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Dequeued);
    assert_eq!(job.owner_token, Some(usurper));
    assert!(job.result.is_none());
}

#[tokio::test]
async fn concurrency_is_bounded() {
    let (queue, _) = setup();
    for i in 0..6 {
        queue
            .enqueue("q", json!({"i": i}), EnqueueOptions::new())
            .await
            .unwrap();
    }

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let worker = queue
        .worker(
            "q",
            move |_: Value| {
                let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            },
            fast().max_concurrency(2),
        )
        .unwrap();
    let mut rx = worker.subscribe();
    worker.start().unwrap();
    collect_until(&mut rx, |seen| retired(seen).len() == 6).await;
    worker.stop().await;

    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn worker_rejects_bad_options() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let handler = |_: Value| async { Ok::<_, HandlerError>(Value::Null) };

    let err = Worker::new(
        Arc::clone(&store),
        "q".into(),
        handler,
        WorkerOptions::new().max_concurrency(0),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = Worker::new(
        Arc::clone(&store),
        "".into(),
        handler,
        WorkerOptions::new(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
