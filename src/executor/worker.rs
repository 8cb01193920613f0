//! Worker: the per-job execution state machine and dependency-gated
//! fan-out.
//!
//! Many independent workers pull execution requests from a shared queue;
//! no lock serializes access to a workflow. Correctness rests on three
//! disciplines instead:
//!
//! - the Running transition is persisted before the body runs, so a crash
//!   afterwards shows "started", never "lost";
//! - fan-out happens only after this job's Finished state is itself
//!   durably persisted;
//! - every readiness decision re-reads the store, so only the worker that
//!   finishes the *last* pending upstream of a dependent observes
//!   all-Finished and enqueues it. Under a true concurrent last-arrival
//!   tie both finishers may enqueue: delivery is at-least-once and job
//!   bodies must tolerate duplicates.

use crate::core::{BoxError, Job, Outcome, Payload};
use crate::executor::error::{Result, WorkerError};
use crate::executor::registry::{JobHandler, Registry};
use crate::storage::{ExecutionRequest, Store};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default cap on queue deliveries per request before the worker invokes
/// the retry-exhaustion hook instead of performing the job.
const DEFAULT_MAX_DELIVERIES: u32 = 25;

/// Executes jobs from a distributed queue.
///
/// The worker exposes two entry points to the queue infrastructure:
/// [`perform`](Worker::perform) for one execution request, and
/// [`handle_retries_exhausted`](Worker::handle_retries_exhausted) for the
/// out-of-band callback when the queue's own delivery budget elapses.
/// [`start`](Worker::start) runs the built-in polling loop that wires both
/// to a [`Store`] queue backend.
///
/// # Example
///
/// ```no_run
/// use spate::{InMemoryStore, Outcome, Worker};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let store = Arc::new(InMemoryStore::new());
/// let worker = Worker::new(store, "worker-1");
/// worker
///     .register_fn("FetchJob", |_job| async { Outcome::success("fetched") })
///     .await;
///
/// let handle = worker.start().await;
/// // ... later:
/// handle.shutdown().await;
/// # }
/// ```
pub struct Worker<S: Store> {
    storage: Arc<S>,
    worker_id: String,
    registry: Arc<RwLock<Registry>>,
    poll_interval: Duration,
    max_deliveries: u32,
    /// Notification handle for event-driven wakeup, when the backend has one.
    work_notify: Option<Arc<Notify>>,
}

impl<S: Store + 'static> Worker<S> {
    /// Creates a worker against the given storage backend.
    ///
    /// # Arguments
    ///
    /// * `storage` - Store/queue backend shared by all workers
    /// * `worker_id` - Unique identifier for this worker
    pub fn new(storage: Arc<S>, worker_id: impl Into<String>) -> Self {
        let work_notify = storage.work_notify();
        Self {
            storage,
            worker_id: worker_id.into(),
            registry: Arc::new(RwLock::new(Registry::new())),
            poll_interval: Duration::from_secs(1),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            work_notify,
        }
    }

    /// Sets the poll interval used when the queue is empty. Default 1s.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the queue-delivery budget after which a request triggers the
    /// retry-exhaustion hook instead of another attempt. Default 25.
    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max;
        self
    }

    /// Registers a handler for a job class.
    pub async fn register<H>(&self, class: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.registry.write().await.register(class, handler);
    }

    /// Registers an async closure as the handler for a job class.
    pub async fn register_fn<F, Fut>(&self, class: impl Into<String>, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.registry.write().await.register_fn(class, f);
    }

    // ========================================================================
    // Execution state machine
    // ========================================================================

    /// Runs one execution request through the job state machine.
    ///
    /// Returning `Ok` acknowledges the request. `Err` asks the queue layer
    /// to apply its redelivery policy: [`WorkerError::Failed`] wants
    /// redelivery, [`WorkerError::Exhausted`] is already terminal in the
    /// store and is propagated for bookkeeping only.
    pub async fn perform(&self, workflow_id: Uuid, job_name: &str) -> Result<()> {
        let mut job = self.load_job(workflow_id, job_name).await?;

        // Deadline check before anything else: an expired loop job fails
        // without the body ever running.
        if job.expired() {
            info!(
                workflow_id = %workflow_id,
                job = %job.name,
                "loop deadline passed, failing job"
            );
            job.mark_failed(false);
            self.storage.persist_job(workflow_id, &job).await?;
            return Ok(());
        }

        // Fresh upstream outputs for this attempt; never a cached snapshot.
        job.payloads = self.incoming_payloads(workflow_id, &job).await?;

        // Durability checkpoint: persisted Running means a crash afterwards
        // shows "started", never "lost".
        job.mark_started();
        self.storage.persist_job(workflow_id, &job).await?;

        debug!(
            workflow_id = %workflow_id,
            job = %job.name,
            class = %job.class,
            attempt = job.attempts,
            "job started"
        );

        let handler = {
            let registry = self.registry.read().await;
            registry.get(&job.class)
        };
        // Registry lock released before the body runs.

        let outcome = match handler {
            Some(handler) => handler.perform(&job).await,
            None => Outcome::error(format!("no handler registered for class: {}", job.class)),
        };

        match outcome {
            Outcome::LoopRetry { interval } => self.requeue_loop(workflow_id, job, interval).await,
            Outcome::SoftFailure => {
                info!(workflow_id = %workflow_id, job = %job.name, "job failed softly");
                job.mark_failed(true);
                self.storage.persist_job(workflow_id, &job).await?;
                Ok(())
            }
            Outcome::Error(cause) => self.fail_hard(workflow_id, job, cause).await,
            Outcome::Success(output) => {
                job.output = Some(output);
                job.mark_finished();
                self.storage.persist_job(workflow_id, &job).await?;
                info!(workflow_id = %workflow_id, job = %job.name, "job finished");

                // Only after Finished is durable may dependents learn of it.
                self.enqueue_outgoing_jobs(workflow_id, &job).await?;

                if let Some(from) = &job.params.clear_job {
                    info!(workflow_id = %workflow_id, job = %job.name, "issuing workflow restart");
                    self.storage.restart_workflow(workflow_id, from).await?;
                }
                Ok(())
            }
        }
    }

    /// Out-of-band callback for when the queue's own retry budget elapses.
    ///
    /// Force-marks the job terminally Failed. Idempotent: an already-failed
    /// record is left untouched, and a missing record is only logged, since
    /// the request identity may outlive a deleted workflow.
    pub async fn handle_retries_exhausted(&self, workflow_id: Uuid, job_name: &str) -> Result<()> {
        let Some(mut job) = self.storage.find_job(workflow_id, job_name).await? else {
            warn!(
                workflow_id = %workflow_id,
                job = job_name,
                "retries exhausted for unknown job"
            );
            return Ok(());
        };

        if job.failed() {
            return Ok(());
        }

        warn!(
            workflow_id = %workflow_id,
            job = %job.name,
            state = %job.state,
            "queue retry budget exhausted, force-failing job"
        );
        job.mark_failed(false);
        self.storage.persist_job(workflow_id, &job).await?;
        Ok(())
    }

    /// Readiness predicate: every upstream of `job` resolves to Finished
    /// in the store right now.
    ///
    /// A job with no upstream edges is always ready.
    pub async fn ready_to_start(&self, workflow_id: Uuid, job: &Job) -> Result<bool> {
        for name in &job.incoming {
            let upstream = self.load_job(workflow_id, name).await?;
            if !upstream.finished() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn load_job(&self, workflow_id: Uuid, name: &str) -> Result<Job> {
        self.storage
            .find_job(workflow_id, name)
            .await?
            .ok_or_else(|| WorkerError::JobNotFound {
                workflow_id,
                name: name.to_string(),
            })
    }

    /// Re-resolves each upstream against current store state, in the
    /// stored order of `incoming`.
    async fn incoming_payloads(&self, workflow_id: Uuid, job: &Job) -> Result<Vec<Payload>> {
        let mut payloads = Vec::with_capacity(job.incoming.len());
        for name in &job.incoming {
            let upstream = self.load_job(workflow_id, name).await?;
            payloads.push(Payload {
                id: upstream.name,
                class: upstream.class,
                output: upstream.output,
            });
        }
        Ok(payloads)
    }

    /// Converts a loop-retry signal into a delayed re-enqueue, bounded by
    /// the configured deadline.
    async fn requeue_loop(
        &self,
        workflow_id: Uuid,
        mut job: Job,
        interval: Option<Duration>,
    ) -> Result<()> {
        if job.expired() {
            info!(
                workflow_id = %workflow_id,
                job = %job.name,
                "loop deadline passed, failing job instead of re-enqueueing"
            );
            job.mark_failed(false);
            self.storage.persist_job(workflow_id, &job).await?;
            return Ok(());
        }

        // A loop without a deadline has no termination mechanism; treat a
        // retry request from an unconfigured job as a hard failure.
        let Some(configured) = job.loop_interval() else {
            return self
                .fail_hard(
                    workflow_id,
                    job,
                    "loop retry requested but no loop_opts configured".into(),
                )
                .await;
        };

        let delay = interval.unwrap_or(configured);
        debug!(
            workflow_id = %workflow_id,
            job = %job.name,
            delay_ms = delay.as_millis() as u64,
            "loop retry, re-enqueueing"
        );
        self.storage
            .enqueue_job(workflow_id, &job, Some(delay))
            .await?;
        Ok(())
    }

    /// Applies the hard-failure policy: re-enqueue while the job's retry
    /// budget lasts, terminal failure once it is spent. Either way the
    /// error propagates to the queue layer after the state is persisted.
    async fn fail_hard(&self, workflow_id: Uuid, mut job: Job, cause: BoxError) -> Result<()> {
        if job.retries_exhausted() {
            error!(
                workflow_id = %workflow_id,
                job = %job.name,
                attempts = job.attempts,
                error = %cause,
                "job failed, retry budget exhausted"
            );
            job.mark_failed(false);
            self.storage.persist_job(workflow_id, &job).await?;
            Err(WorkerError::Exhausted {
                name: job.name,
                attempts: job.attempts,
                source: cause,
            })
        } else {
            warn!(
                workflow_id = %workflow_id,
                job = %job.name,
                attempt = job.attempts,
                error = %cause,
                "job failed, will retry via redelivery"
            );
            job.mark_enqueued();
            self.storage.persist_job(workflow_id, &job).await?;
            Err(WorkerError::Failed {
                name: job.name,
                source: cause,
            })
        }
    }

    /// Dependency-gated fan-out: enqueue each dependent whose upstreams
    /// are all Finished, judged against a fresh read of the store.
    ///
    /// At-least-once: two workers finishing different upstreams of a
    /// shared dependent can both observe readiness and both enqueue it.
    async fn enqueue_outgoing_jobs(&self, workflow_id: Uuid, job: &Job) -> Result<()> {
        for name in &job.outgoing {
            let dependent = self.load_job(workflow_id, name).await?;
            if self.ready_to_start(workflow_id, &dependent).await? {
                debug!(
                    workflow_id = %workflow_id,
                    job = %dependent.name,
                    "dependencies satisfied, enqueueing"
                );
                self.storage
                    .enqueue_job(workflow_id, &dependent, None)
                    .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Background polling loop
    // ========================================================================

    /// Runs one dequeued request, mapping the outcome onto the queue's
    /// acknowledgment protocol.
    async fn process_request(&self, request: ExecutionRequest) {
        // The queue's own delivery budget, checked before the job's.
        if request.deliveries > self.max_deliveries {
            warn!(
                worker_id = %self.worker_id,
                workflow_id = %request.workflow_id,
                job = %request.job_name,
                deliveries = request.deliveries,
                "delivery budget exhausted, invoking exhaustion hook"
            );
            if let Err(e) = self
                .handle_retries_exhausted(request.workflow_id, &request.job_name)
                .await
            {
                error!(worker_id = %self.worker_id, error = %e, "exhaustion hook failed");
            }
            if let Err(e) = self.storage.ack_request(&request).await {
                warn!(worker_id = %self.worker_id, error = %e, "failed to ack request");
            }
            return;
        }

        match self.perform(request.workflow_id, &request.job_name).await {
            Ok(()) => {
                if let Err(e) = self.storage.ack_request(&request).await {
                    warn!(worker_id = %self.worker_id, error = %e, "failed to ack request");
                }
            }
            Err(e @ WorkerError::Exhausted { .. }) => {
                // Terminal state already recorded; redelivery would be
                // pointless, so acknowledge.
                error!(worker_id = %self.worker_id, error = %e, "job exhausted");
                if let Err(e) = self.storage.ack_request(&request).await {
                    warn!(worker_id = %self.worker_id, error = %e, "failed to ack request");
                }
            }
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    error = %e,
                    "request failed, returning to queue"
                );
                if let Err(e) = self.storage.nack_request(&request).await {
                    warn!(worker_id = %self.worker_id, error = %e, "failed to nack request");
                }
            }
        }
    }

    /// Starts the worker in the background.
    ///
    /// The loop processes one request at a time: the worker holds its slot
    /// for the full duration of body execution plus fan-out. A 1s
    /// maintenance tick promotes delayed requests whose time has come.
    ///
    /// Returns a [`WorkerHandle`] used to stop the worker.
    pub async fn start(self) -> WorkerHandle {
        let cancellation_token = CancellationToken::new();
        let worker_token = cancellation_token.clone();
        let worker_id_for_handle = self.worker_id.clone();

        info!("starting worker: {}", self.worker_id);

        let handle = tokio::spawn(async move {
            let mut delayed_interval = tokio::time::interval(Duration::from_secs(1));
            delayed_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            // Deterministic per-worker jitter so idle workers don't hit the
            // backend in lockstep.
            let worker_hash = self
                .worker_id
                .as_bytes()
                .iter()
                .fold(0u64, |acc, &b| acc.wrapping_add(b as u64));
            let jitter = Duration::from_millis(1 + (worker_hash % 5));

            loop {
                tokio::select! {
                    biased;

                    _ = worker_token.cancelled() => {
                        info!("worker {} received shutdown signal", self.worker_id);
                        break;
                    }

                    _ = delayed_interval.tick() => {
                        match self.storage.move_ready_delayed_requests().await {
                            Ok(count) if count > 0 => {
                                debug!("worker {} promoted {} delayed requests", self.worker_id, count);
                            }
                            Err(e) => {
                                warn!("worker {} failed to promote delayed requests: {}", self.worker_id, e);
                            }
                            _ => {}
                        }
                    }

                    result = self.storage.dequeue_request(&self.worker_id) => {
                        match result {
                            Ok(Some(request)) => {
                                self.process_request(request).await;
                            }
                            Ok(None) => {
                                // Queue empty: sleep, woken early if the
                                // backend signals new work.
                                let sleep_duration = self.poll_interval + jitter;
                                match &self.work_notify {
                                    Some(notify) => {
                                        tokio::time::timeout(sleep_duration, notify.notified())
                                            .await
                                            .ok();
                                    }
                                    None => tokio::time::sleep(sleep_duration).await,
                                }
                            }
                            Err(e) => {
                                warn!("worker {} failed to dequeue: {}", self.worker_id, e);
                                tokio::time::sleep(self.poll_interval + jitter).await;
                            }
                        }
                    }
                }
            }

            info!("worker {} stopped", self.worker_id);
        });

        WorkerHandle {
            worker_id: worker_id_for_handle,
            handle,
            cancellation_token,
        }
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl WorkerHandle {
    /// Returns the worker ID.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns a reference to the cancellation token, for hierarchical
    /// cancellation.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Requests a graceful shutdown and waits for the loop to finish its
    /// in-flight request.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.handle.await;
    }

    /// Returns true if the worker task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the worker immediately. May leave a job Running in the
    /// store; prefer [`shutdown`](WorkerHandle::shutdown).
    pub fn abort(&self) {
        self.handle.abort();
    }
}
