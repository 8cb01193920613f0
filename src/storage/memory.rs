//! In-memory store using DashMap for concurrent access.
//!
//! Job records live in a lock-free concurrent map, so many workers inside
//! one process can hit the store the way they would hit a shared backend:
//! interleaved read-then-persist with no coordination. The request queue
//! is a pending deque plus a delayed set promoted by the worker loop's
//! maintenance tick.
//!
//! Only suitable for single-process use; the queue is not shared across
//! processes. Tests and local development use this backend, distributed
//! deployments use [`RedisStore`](crate::storage::RedisStore).

use super::{error::Result, error::StorageError, ExecutionRequest, Store};
use crate::core::Job;
use crate::graph::Workflow;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// In-memory store and queue.
pub struct InMemoryStore {
    /// Job records keyed by (workflow_id, job name).
    jobs: dashmap::DashMap<(Uuid, String), Job>,
    /// Job name order per workflow, for deterministic reconstruction.
    workflows: dashmap::DashMap<Uuid, Vec<String>>,
    /// Requests due for delivery, FIFO.
    pending: Mutex<VecDeque<ExecutionRequest>>,
    /// Requests whose run_at is in the future.
    delayed: Mutex<Vec<ExecutionRequest>>,
    /// Restart calls received, newest last. Lets callers observe the
    /// `from` value a restart carried.
    restarts: dashmap::DashMap<Uuid, Vec<Value>>,
    /// Redelivery delay applied when a request is returned to the queue.
    redelivery_delay: Duration,
    /// Wakes workers when new work arrives.
    work_notify: Arc<Notify>,
}

impl InMemoryStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self {
            jobs: dashmap::DashMap::new(),
            workflows: dashmap::DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(Vec::new()),
            restarts: dashmap::DashMap::new(),
            redelivery_delay: Duration::ZERO,
            work_notify: Arc::new(Notify::new()),
        }
    }

    /// Sets the delay before a negatively-acknowledged request is
    /// delivered again.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Restart calls recorded for a workflow, oldest first.
    pub fn restarts(&self, workflow_id: Uuid) -> Vec<Value> {
        self.restarts
            .get(&workflow_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Number of requests currently waiting for delivery (due or delayed).
    pub fn queued_requests(&self) -> usize {
        let pending = self.pending.lock().expect("queue lock poisoned").len();
        let delayed = self.delayed.lock().expect("queue lock poisoned").len();
        pending + delayed
    }

    fn push_request(&self, request: ExecutionRequest) {
        if request.due(Utc::now()) {
            self.pending
                .lock()
                .expect("queue lock poisoned")
                .push_back(request);
            self.work_notify.notify_one();
        } else {
            self.delayed
                .lock()
                .expect("queue lock poisoned")
                .push(request);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        let order: Vec<String> = workflow.jobs().map(|job| job.name.clone()).collect();
        self.workflows.insert(workflow.id(), order);
        for job in workflow.jobs() {
            self.jobs
                .insert((workflow.id(), job.name.clone()), job.clone());
        }
        Ok(())
    }

    async fn find_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>> {
        let Some(order) = self.workflows.get(&workflow_id) else {
            return Ok(None);
        };

        let mut jobs = Vec::with_capacity(order.len());
        for name in order.iter() {
            let job = self
                .jobs
                .get(&(workflow_id, name.clone()))
                .map(|entry| entry.value().clone())
                .ok_or_else(|| StorageError::JobNotFound {
                    workflow_id,
                    name: name.clone(),
                })?;
            jobs.push(job);
        }
        Ok(Some(Workflow::from_jobs(workflow_id, jobs)))
    }

    async fn find_job(&self, workflow_id: Uuid, name: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .get(&(workflow_id, name.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn persist_job(&self, workflow_id: Uuid, job: &Job) -> Result<()> {
        self.jobs
            .insert((workflow_id, job.name.clone()), job.clone());
        Ok(())
    }

    async fn enqueue_job(
        &self,
        workflow_id: Uuid,
        job: &Job,
        delay: Option<Duration>,
    ) -> Result<()> {
        let mut enqueued = job.clone();
        enqueued.mark_enqueued();
        self.persist_job(workflow_id, &enqueued).await?;

        let request = match delay {
            Some(delay) if !delay.is_zero() => {
                ExecutionRequest::delayed(workflow_id, &job.name, delay)
            }
            _ => ExecutionRequest::new(workflow_id, &job.name),
        };
        self.push_request(request);
        Ok(())
    }

    async fn restart_workflow(&self, workflow_id: Uuid, from: &Value) -> Result<()> {
        let order = self
            .workflows
            .get(&workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::WorkflowNotFound(workflow_id))?;

        self.restarts
            .entry(workflow_id)
            .or_default()
            .push(from.clone());

        let mut initial = Vec::new();
        for name in &order {
            let key = (workflow_id, name.clone());
            let mut entry = self
                .jobs
                .get_mut(&key)
                .ok_or_else(|| StorageError::JobNotFound {
                    workflow_id,
                    name: name.clone(),
                })?;
            entry.reset();
            if entry.incoming.is_empty() {
                initial.push(entry.clone());
            }
        }

        for job in initial {
            self.enqueue_job(workflow_id, &job, None).await?;
        }
        Ok(())
    }

    async fn dequeue_request(&self, _worker_id: &str) -> Result<Option<ExecutionRequest>> {
        let mut pending = self.pending.lock().expect("queue lock poisoned");
        let Some(mut request) = pending.pop_front() else {
            return Ok(None);
        };
        request.deliveries += 1;
        Ok(Some(request))
    }

    async fn ack_request(&self, _request: &ExecutionRequest) -> Result<()> {
        // Dequeue already removed the request; nothing to clean up.
        Ok(())
    }

    async fn nack_request(&self, request: &ExecutionRequest) -> Result<()> {
        let mut returned = request.clone();
        returned.run_at = super::queue::run_after(Utc::now(), self.redelivery_delay);
        self.push_request(returned);
        Ok(())
    }

    async fn move_ready_delayed_requests(&self) -> Result<usize> {
        let now = Utc::now();
        let ready: Vec<ExecutionRequest> = {
            let mut delayed = self.delayed.lock().expect("queue lock poisoned");
            let (due, rest): (Vec<_>, Vec<_>) =
                delayed.drain(..).partition(|request| request.due(now));
            *delayed = rest;
            due
        };

        let count = ready.len();
        if count > 0 {
            let mut pending = self.pending.lock().expect("queue lock poisoned");
            pending.extend(ready);
            drop(pending);
            self.work_notify.notify_one();
        }
        Ok(count)
    }

    fn work_notify(&self) -> Option<Arc<Notify>> {
        Some(self.work_notify.clone())
    }
}
