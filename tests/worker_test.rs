//! Integration tests driving the worker state machine against the
//! in-memory store, the same way the queue infrastructure drives it:
//! one `perform` call per execution request.

use spate::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// Single-job workflow, persisted and ready to perform.
async fn single_job_workflow(store: &Arc<InMemoryStore>, job: Job) -> Uuid {
    let mut workflow = Workflow::new();
    let name = job.name.clone();
    workflow.add_job(job).unwrap();
    store.create_workflow(&workflow).await.unwrap();
    // Jobs normally arrive Enqueued; mirror that before performing.
    let stored = store.find_job(workflow.id(), &name).await.unwrap().unwrap();
    store.enqueue_job(workflow.id(), &stored, None).await.unwrap();
    // Drain the request the enqueue created so tests can count fresh ones.
    store.dequeue_request("setup").await.unwrap();
    workflow.id()
}

async fn job_state(store: &Arc<InMemoryStore>, workflow_id: Uuid, name: &str) -> Job {
    store.find_job(workflow_id, name).await.unwrap().unwrap()
}

#[tokio::test]
async fn soft_failure_is_absorbed_and_recorded() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let workflow_id = single_job_workflow(&store, Job::new("ingest", "IngestJob")).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("IngestJob", |_job| async { Outcome::SoftFailure })
        .await;

    // Returns without raising: the delivery is acknowledged.
    worker.perform(workflow_id, "ingest").await.unwrap();

    let job = job_state(&store, workflow_id, "ingest").await;
    assert!(job.failed());
    assert!(job.failed_softly());
}

#[tokio::test]
async fn hard_failure_without_retries_is_terminal_and_propagates() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let workflow_id = single_job_workflow(&store, Job::new("ingest", "IngestJob")).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("IngestJob", |_job| async {
            Outcome::error(std::io::Error::other("schema mismatch"))
        })
        .await;

    let result = worker.perform(workflow_id, "ingest").await;
    assert!(matches!(result, Err(WorkerError::Exhausted { .. })));

    let job = job_state(&store, workflow_id, "ingest").await;
    assert!(job.failed());
    assert!(!job.failed_softly());
}

#[tokio::test]
async fn hard_failure_with_retries_remaining_requeues_and_propagates() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut job = Job::new("ingest", "IngestJob");
    job.params.retry = Some(RetryPolicy::with_max_attempts(3));
    let workflow_id = single_job_workflow(&store, job).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("IngestJob", |_job| async {
            Outcome::error(std::io::Error::other("connection reset"))
        })
        .await;

    let result = worker.perform(workflow_id, "ingest").await;
    assert!(matches!(result, Err(WorkerError::Failed { .. })));

    let job = job_state(&store, workflow_id, "ingest").await;
    assert!(!job.failed());
    assert!(job.enqueued());
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn hard_failure_budget_exhausts_across_redeliveries() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut job = Job::new("ingest", "IngestJob");
    job.params.retry = Some(RetryPolicy::with_max_attempts(2));
    let workflow_id = single_job_workflow(&store, job).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("IngestJob", |_job| async {
            Outcome::error(std::io::Error::other("still down"))
        })
        .await;

    // First attempt: budget not yet spent, record goes back to Enqueued.
    let first = worker.perform(workflow_id, "ingest").await;
    assert!(matches!(first, Err(WorkerError::Failed { .. })));
    assert!(job_state(&store, workflow_id, "ingest").await.enqueued());

    // Redelivery: second attempt spends the budget.
    let second = worker.perform(workflow_id, "ingest").await;
    assert!(matches!(
        second,
        Err(WorkerError::Exhausted { attempts: 2, .. })
    ));
    let job = job_state(&store, workflow_id, "ingest").await;
    assert!(job.failed());
    assert!(!job.failed_softly());
}

#[tokio::test]
async fn transient_failure_then_success() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut job = Job::new("ingest", "IngestJob");
    job.params.retry = Some(RetryPolicy::with_max_attempts(3));
    let workflow_id = single_job_workflow(&store, job).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Worker::new(store.clone(), "w1");
    let counter = calls.clone();
    worker
        .register_fn("IngestJob", move |_job| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Outcome::error(std::io::Error::other("flaky"))
                } else {
                    Outcome::success("ok")
                }
            }
        })
        .await;

    assert!(worker.perform(workflow_id, "ingest").await.is_err());
    worker.perform(workflow_id, "ingest").await.unwrap();

    let job = job_state(&store, workflow_id, "ingest").await;
    assert!(job.finished());
    assert_eq!(job.attempts, 2);
    assert_eq!(job.output, Some(serde_json::json!("ok")));
}

#[tokio::test]
async fn loop_retry_before_deadline_enqueues_one_delayed_request() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut job = Job::new("watch", "WatchJob");
    job.params.loop_opts = Some(LoopOpts {
        interval: Duration::from_secs(10),
        end_time: chrono::Utc::now() + chrono::Duration::seconds(100),
    });
    let workflow_id = single_job_workflow(&store, job).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("WatchJob", |_job| async { Outcome::loop_retry() })
        .await;

    worker.perform(workflow_id, "watch").await.unwrap();

    let job = job_state(&store, workflow_id, "watch").await;
    assert!(!job.failed());
    assert!(job.enqueued());
    // Exactly one new request, parked with the configured delay.
    assert_eq!(store.queued_requests(), 1);
    assert_eq!(store.move_ready_delayed_requests().await.unwrap(), 0);
}

#[tokio::test]
async fn loop_retry_past_deadline_fails_without_running_the_body() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut job = Job::new("watch", "WatchJob");
    job.params.loop_opts = Some(LoopOpts {
        interval: Duration::from_secs(10),
        end_time: chrono::Utc::now() - chrono::Duration::seconds(1),
    });
    let workflow_id = single_job_workflow(&store, job).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Worker::new(store.clone(), "w1");
    let counter = calls.clone();
    worker
        .register_fn("WatchJob", move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Outcome::loop_retry() }
        })
        .await;

    worker.perform(workflow_id, "watch").await.unwrap();

    let job = job_state(&store, workflow_id, "watch").await;
    assert!(job.failed());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.queued_requests(), 0);
}

#[tokio::test]
async fn loop_retry_when_deadline_passes_mid_body_fails() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut job = Job::new("watch", "WatchJob");
    job.params.loop_opts = Some(LoopOpts {
        interval: Duration::from_secs(10),
        end_time: chrono::Utc::now() + chrono::Duration::milliseconds(100),
    });
    let workflow_id = single_job_workflow(&store, job).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("WatchJob", |_job| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Outcome::loop_retry()
        })
        .await;

    worker.perform(workflow_id, "watch").await.unwrap();

    let job = job_state(&store, workflow_id, "watch").await;
    assert!(job.failed());
    assert_eq!(store.queued_requests(), 0);
}

#[tokio::test]
async fn loop_retry_without_loop_opts_is_a_hard_failure() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let workflow_id = single_job_workflow(&store, Job::new("watch", "WatchJob")).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("WatchJob", |_job| async { Outcome::loop_retry() })
        .await;

    let result = worker.perform(workflow_id, "watch").await;
    assert!(matches!(result, Err(WorkerError::Exhausted { .. })));
    assert!(job_state(&store, workflow_id, "watch").await.failed());
}

#[tokio::test]
async fn readiness_requires_every_upstream_finished() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut workflow = Workflow::new();
    workflow.add_job(Job::new("a", "A")).unwrap();
    workflow.add_job(Job::new("b", "B")).unwrap();
    workflow.add_job(Job::new("c", "C")).unwrap();
    workflow.link("a", "c").unwrap();
    workflow.link("b", "c").unwrap();
    store.create_workflow(&workflow).await.unwrap();
    let workflow_id = workflow.id();

    let worker = Worker::new(store.clone(), "w1");

    // Empty incoming set: always ready.
    let a = job_state(&store, workflow_id, "a").await;
    assert!(worker.ready_to_start(workflow_id, &a).await.unwrap());

    // One upstream Finished, the other still Pending: not ready.
    let mut a = job_state(&store, workflow_id, "a").await;
    a.mark_finished();
    store.persist_job(workflow_id, &a).await.unwrap();
    let c = job_state(&store, workflow_id, "c").await;
    assert!(!worker.ready_to_start(workflow_id, &c).await.unwrap());

    // Upstream in any non-Finished state blocks readiness.
    for make_state in [
        Job::mark_enqueued as fn(&mut Job),
        Job::mark_started,
        |job: &mut Job| job.mark_failed(false),
    ] {
        let mut b = job_state(&store, workflow_id, "b").await;
        make_state(&mut b);
        store.persist_job(workflow_id, &b).await.unwrap();
        let c = job_state(&store, workflow_id, "c").await;
        assert!(!worker.ready_to_start(workflow_id, &c).await.unwrap());
    }

    // Both Finished: ready.
    let mut b = job_state(&store, workflow_id, "b").await;
    b.mark_finished();
    store.persist_job(workflow_id, &b).await.unwrap();
    let c = job_state(&store, workflow_id, "c").await;
    assert!(worker.ready_to_start(workflow_id, &c).await.unwrap());
}

#[tokio::test]
async fn fan_out_waits_for_the_last_upstream() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut workflow = Workflow::new();
    workflow.add_job(Job::new("a", "SourceJob")).unwrap();
    workflow.add_job(Job::new("b", "SourceJob")).unwrap();
    workflow.add_job(Job::new("c", "SinkJob")).unwrap();
    workflow.link("a", "c").unwrap();
    workflow.link("b", "c").unwrap();
    store.create_workflow(&workflow).await.unwrap();
    let workflow_id = workflow.id();

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("SourceJob", |job| async move { Outcome::success(job.name) })
        .await;
    worker
        .register_fn("SinkJob", |job| async move {
            let sources: Vec<Option<serde_json::Value>> =
                job.payloads.iter().map(|p| p.output.clone()).collect();
            Outcome::success(sources)
        })
        .await;

    // A finishes first: C still has a pending upstream, no enqueue.
    worker.perform(workflow_id, "a").await.unwrap();
    assert!(job_state(&store, workflow_id, "c").await.pending());
    assert_eq!(store.queued_requests(), 0);

    // B finishes second: the readiness check now sees both Finished.
    worker.perform(workflow_id, "b").await.unwrap();
    assert!(job_state(&store, workflow_id, "c").await.enqueued());
    assert_eq!(store.queued_requests(), 1);

    // Drive the enqueued dependent; payloads follow incoming order.
    let request = store.dequeue_request("w1").await.unwrap().unwrap();
    assert_eq!(request.job_name, "c");
    worker.perform(workflow_id, "c").await.unwrap();

    let c = job_state(&store, workflow_id, "c").await;
    assert!(c.finished());
    assert_eq!(c.output, Some(serde_json::json!(["a", "b"])));
}

#[tokio::test]
async fn payloads_are_rebuilt_from_current_store_state() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut workflow = Workflow::new();
    workflow.add_job(Job::new("a", "SourceJob")).unwrap();
    workflow.add_job(Job::new("b", "SinkJob")).unwrap();
    workflow.link("a", "b").unwrap();
    store.create_workflow(&workflow).await.unwrap();
    let workflow_id = workflow.id();

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("SourceJob", |_job| async { Outcome::success("v1") })
        .await;
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    worker
        .register_fn("SinkJob", move |job| {
            let sink_seen = sink_seen.clone();
            async move {
                sink_seen
                    .lock()
                    .unwrap()
                    .push(job.payloads[0].output.clone());
                Outcome::success(())
            }
        })
        .await;

    worker.perform(workflow_id, "a").await.unwrap();
    worker.perform(workflow_id, "b").await.unwrap();

    // Upstream output changes between attempts; the retried body must
    // observe the fresh value, not a snapshot.
    let mut a = job_state(&store, workflow_id, "a").await;
    a.output = Some(serde_json::json!("v2"));
    store.persist_job(workflow_id, &a).await.unwrap();
    worker.perform(workflow_id, "b").await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            Some(serde_json::json!("v1")),
            Some(serde_json::json!("v2"))
        ]
    );
}

#[tokio::test]
async fn clear_job_triggers_restart_with_value_unchanged() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut job = Job::new("finalize", "FinalizeJob");
    let marker = serde_json::json!({"cursor": "2024-01-01", "page": 7});
    job.params.clear_job = Some(marker.clone());
    let workflow_id = single_job_workflow(&store, job).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("FinalizeJob", |_job| async { Outcome::success("done") })
        .await;

    worker.perform(workflow_id, "finalize").await.unwrap();

    assert_eq!(store.restarts(workflow_id), vec![marker]);
}

#[tokio::test]
async fn re_performing_a_finished_job_is_safe() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let workflow_id = single_job_workflow(&store, Job::new("ingest", "IngestJob")).await;

    let worker = Worker::new(store.clone(), "w1");
    worker
        .register_fn("IngestJob", |_job| async { Outcome::success(7) })
        .await;

    worker.perform(workflow_id, "ingest").await.unwrap();
    // Duplicate delivery of the same request.
    worker.perform(workflow_id, "ingest").await.unwrap();

    let job = job_state(&store, workflow_id, "ingest").await;
    assert!(job.finished());
    assert_eq!(job.output, Some(serde_json::json!(7)));
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn exhaustion_hook_force_fails_and_is_idempotent() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let workflow_id = single_job_workflow(&store, Job::new("ingest", "IngestJob")).await;

    // Simulate a job stuck Running after a worker crash.
    let mut job = job_state(&store, workflow_id, "ingest").await;
    job.mark_started();
    store.persist_job(workflow_id, &job).await.unwrap();

    let worker: Worker<InMemoryStore> = Worker::new(store.clone(), "w1");
    worker
        .handle_retries_exhausted(workflow_id, "ingest")
        .await
        .unwrap();

    let job = job_state(&store, workflow_id, "ingest").await;
    assert!(job.failed());
    assert!(!job.failed_softly());
    let first_failed_at = job.failed_at;

    // Applying the hook to an already-failed record changes nothing.
    worker
        .handle_retries_exhausted(workflow_id, "ingest")
        .await
        .unwrap();
    let job = job_state(&store, workflow_id, "ingest").await;
    assert_eq!(job.failed_at, first_failed_at);

    // Unknown identities are absorbed, not errors.
    worker
        .handle_retries_exhausted(workflow_id, "ghost")
        .await
        .unwrap();
}

#[tokio::test]
async fn background_worker_drains_a_workflow() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut workflow = Workflow::new();
    workflow.add_job(Job::new("fetch", "FetchJob")).unwrap();
    workflow.add_job(Job::new("left", "StepJob")).unwrap();
    workflow.add_job(Job::new("right", "StepJob")).unwrap();
    workflow.add_job(Job::new("merge", "MergeJob")).unwrap();
    workflow.link("fetch", "left").unwrap();
    workflow.link("fetch", "right").unwrap();
    workflow.link("left", "merge").unwrap();
    workflow.link("right", "merge").unwrap();
    let workflow_id = workflow.id();

    let worker = Worker::new(store.clone(), "w1").with_poll_interval(Duration::from_millis(20));
    worker
        .register_fn("FetchJob", |_job| async { Outcome::success(1) })
        .await;
    worker
        .register_fn("StepJob", |job| async move {
            let upstream = job.payloads[0].output.clone().unwrap();
            Outcome::success(upstream.as_i64().unwrap() + 1)
        })
        .await;
    worker
        .register_fn("MergeJob", |job| async move {
            let total: i64 = job
                .payloads
                .iter()
                .filter_map(|p| p.output.as_ref().and_then(|v| v.as_i64()))
                .sum();
            Outcome::success(total)
        })
        .await;

    Scheduler::new(store.clone())
        .create_and_start(&workflow)
        .await
        .unwrap();
    let handle = worker.start().await;

    // Wait for the sink to finish.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let merge = job_state(&store, workflow_id, "merge").await;
        if merge.finished() {
            assert_eq!(merge.output, Some(serde_json::json!(4)));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow did not finish in time; merge state: {}",
            merge.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn delivery_budget_invokes_exhaustion_hook() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let workflow_id = single_job_workflow(&store, Job::new("ingest", "IngestJob")).await;

    let worker = Worker::new(store.clone(), "w1")
        .with_poll_interval(Duration::from_millis(20))
        .with_max_deliveries(2);
    // A handler that always asks for redelivery.
    worker
        .register_fn("IngestJob", |_job| async {
            Outcome::error(std::io::Error::other("never works"))
        })
        .await;
    // Give the job its own generous budget so the queue budget trips first.
    let mut job = job_state(&store, workflow_id, "ingest").await;
    job.params.retry = Some(RetryPolicy::with_max_attempts(100));
    store.persist_job(workflow_id, &job).await.unwrap();
    store.enqueue_job(workflow_id, &job, None).await.unwrap();

    let handle = worker.start().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = job_state(&store, workflow_id, "ingest").await;
        if job.failed() {
            assert!(!job.failed_softly());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "exhaustion hook never fired; state: {}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.shutdown().await;
}
