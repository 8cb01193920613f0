//! Workflow scheduler.
//!
//! The scheduler is the write-side entry point: it validates a workflow,
//! persists its job records, and enqueues the initial jobs so workers can
//! pick them up.

use crate::executor::error::Result;
use crate::graph::Workflow;
use crate::storage::{Store, StorageError};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Persists and starts workflows against a storage backend.
///
/// # Example
///
/// ```no_run
/// use spate::{InMemoryStore, Job, Scheduler, Workflow};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(InMemoryStore::new());
/// let scheduler = Scheduler::new(store);
///
/// let mut workflow = Workflow::new();
/// workflow.add_job(Job::new("fetch", "FetchJob"))?;
/// workflow.add_job(Job::new("publish", "PublishJob"))?;
/// workflow.link("fetch", "publish")?;
///
/// scheduler.create_and_start(&workflow).await?;
/// # Ok(())
/// # }
/// ```
pub struct Scheduler<S: Store> {
    storage: Arc<S>,
}

impl<S: Store> Scheduler<S> {
    /// Creates a scheduler with the given storage backend.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Validates the workflow and persists all of its job records.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the DAG is invalid (dangling edges,
    /// cycles), or a storage error if persistence fails.
    pub async fn create(&self, workflow: &Workflow) -> Result<()> {
        workflow.validate()?;
        self.storage.create_workflow(workflow).await?;
        info!(workflow_id = %workflow.id(), jobs = workflow.len(), "workflow created");
        Ok(())
    }

    /// Enqueues every initial job (no upstream dependencies) that is
    /// still Pending. Returns the number enqueued.
    pub async fn start(&self, workflow_id: Uuid) -> Result<usize> {
        let workflow = self
            .storage
            .find_workflow(workflow_id)
            .await?
            .ok_or(StorageError::WorkflowNotFound(workflow_id))?;

        let mut started = 0;
        for job in workflow.initial_jobs() {
            if job.pending() {
                self.storage.enqueue_job(workflow_id, job, None).await?;
                started += 1;
            }
        }
        info!(workflow_id = %workflow_id, started, "workflow started");
        Ok(started)
    }

    /// Persists the workflow and enqueues its initial jobs.
    pub async fn create_and_start(&self, workflow: &Workflow) -> Result<usize> {
        self.create(workflow).await?;
        self.start(workflow.id()).await
    }

    /// Returns a reference to the underlying storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}
