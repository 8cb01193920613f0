//! Storage layer: the store/queue gateway workers run against.
//!
//! This module provides a trait-based interface for persisting job state
//! and exchanging execution requests, with two backend implementations:
//!
//! - [`InMemoryStore`]: fast dashmap-based storage for testing and
//!   single-process use
//! - [`RedisStore`]: Redis-based storage for true distributed execution
//!   (`redis` feature)
//!
//! Persistence is a best-effort overwrite: no backend promises
//! compare-and-swap on [`Store::persist_job`], and the worker core is
//! written to stay correct without one.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

mod error;
pub mod memory;
mod queue;

#[cfg(feature = "redis")]
pub mod redis;

pub use error::{Result, StorageError};
pub use memory::InMemoryStore;
pub use queue::ExecutionRequest;

#[cfg(feature = "redis")]
pub use redis::RedisStore;

use crate::core::Job;
use crate::graph::Workflow;

/// Trait for store/queue backends.
///
/// The first group of methods is the store side the worker core consumes:
/// job lookup, durable overwrite, enqueue, and workflow restart. The
/// second group is the queue side the background worker loop consumes;
/// those default to [`StorageError::Unsupported`] so store-only backends
/// stay valid trait implementations.
///
/// Implementations must be thread-safe; `async_trait` keeps truly async
/// backends (connection pools, network round-trips) first-class.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a workflow's topology and all of its job records.
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Loads a workflow with the current state of all of its jobs.
    async fn find_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>>;

    /// Loads one job record, or `None` when it does not exist.
    async fn find_job(&self, workflow_id: Uuid, name: &str) -> Result<Option<Job>>;

    /// Durably overwrites a job record. No atomicity is guaranteed beyond
    /// the single record.
    async fn persist_job(&self, workflow_id: Uuid, job: &Job) -> Result<()>;

    /// Persists the job's Enqueued transition and submits a new execution
    /// request, optionally delayed.
    async fn enqueue_job(
        &self,
        workflow_id: Uuid,
        job: &Job,
        delay: Option<Duration>,
    ) -> Result<()>;

    /// Full workflow reset: every job back to a fresh Pending record, the
    /// initial jobs re-enqueued, and `from` recorded verbatim.
    async fn restart_workflow(&self, workflow_id: Uuid, from: &Value) -> Result<()>;

    // ===== Queue side =====

    /// Claims the next due execution request for this worker.
    ///
    /// Returns `None` when no request is due. Redelivery of claimed but
    /// unacknowledged requests is the backend's own policy; each delivery
    /// increments the request's `deliveries` counter.
    async fn dequeue_request(&self, worker_id: &str) -> Result<Option<ExecutionRequest>> {
        let _ = worker_id;
        Err(StorageError::Unsupported(
            "request queue not implemented for this storage backend".to_string(),
        ))
    }

    /// Acknowledges a delivered request, removing it from the queue.
    async fn ack_request(&self, request: &ExecutionRequest) -> Result<()> {
        let _ = request;
        Err(StorageError::Unsupported(
            "request queue not implemented for this storage backend".to_string(),
        ))
    }

    /// Returns a delivered request to the queue for redelivery with the
    /// backend's own backoff.
    async fn nack_request(&self, request: &ExecutionRequest) -> Result<()> {
        let _ = request;
        Err(StorageError::Unsupported(
            "request queue not implemented for this storage backend".to_string(),
        ))
    }

    /// Promotes delayed requests whose `run_at` has arrived. Returns the
    /// number promoted. Called periodically by the worker loop.
    async fn move_ready_delayed_requests(&self) -> Result<usize> {
        Err(StorageError::Unsupported(
            "request queue not implemented for this storage backend".to_string(),
        ))
    }

    /// Notification handle that fires when new work may be available,
    /// letting workers wake up early instead of sleeping a full poll
    /// interval.
    fn work_notify(&self) -> Option<Arc<Notify>> {
        None
    }
}

// Allow type-erased storage handles.
#[async_trait]
impl Store for Box<dyn Store> {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        (**self).create_workflow(workflow).await
    }

    async fn find_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>> {
        (**self).find_workflow(workflow_id).await
    }

    async fn find_job(&self, workflow_id: Uuid, name: &str) -> Result<Option<Job>> {
        (**self).find_job(workflow_id, name).await
    }

    async fn persist_job(&self, workflow_id: Uuid, job: &Job) -> Result<()> {
        (**self).persist_job(workflow_id, job).await
    }

    async fn enqueue_job(
        &self,
        workflow_id: Uuid,
        job: &Job,
        delay: Option<Duration>,
    ) -> Result<()> {
        (**self).enqueue_job(workflow_id, job, delay).await
    }

    async fn restart_workflow(&self, workflow_id: Uuid, from: &Value) -> Result<()> {
        (**self).restart_workflow(workflow_id, from).await
    }

    async fn dequeue_request(&self, worker_id: &str) -> Result<Option<ExecutionRequest>> {
        (**self).dequeue_request(worker_id).await
    }

    async fn ack_request(&self, request: &ExecutionRequest) -> Result<()> {
        (**self).ack_request(request).await
    }

    async fn nack_request(&self, request: &ExecutionRequest) -> Result<()> {
        (**self).nack_request(request).await
    }

    async fn move_ready_delayed_requests(&self) -> Result<usize> {
        (**self).move_ready_delayed_requests().await
    }

    fn work_notify(&self) -> Option<Arc<Notify>> {
        (**self).work_notify()
    }
}
