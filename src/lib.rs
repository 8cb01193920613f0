//! Spate: DAG workflow orchestration over an at-least-once job queue.
//!
//! `spate` runs workflows defined as directed acyclic graphs of named
//! jobs. Independent worker processes pull execution requests from a
//! shared queue; each request advances exactly one job through its
//! lifecycle and, on success, fans out to the dependents whose upstream
//! dependencies are now satisfied.
//!
//! # Features
//!
//! - **Dependency-gated fan-out**: a dependent runs only once every
//!   upstream job is Finished, judged against a fresh read of the store
//! - **No central lock**: correctness under concurrent, duplicate, and
//!   partially-ordered delivery comes from persistence discipline, not
//!   coordination
//! - **Failure taxonomy**: soft failures, bounded loop retries, and hard
//!   failures with a per-job retry budget
//! - **Pluggable storage**: in-memory for tests, Redis for distributed
//!   deployments
//!
//! # Quick Start
//!
//! ```
//! use spate::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//!
//! // Define a two-step workflow: fetch then publish.
//! let mut workflow = Workflow::new();
//! workflow.add_job(Job::new("fetch", "FetchJob"))?;
//! workflow.add_job(Job::new("publish", "PublishJob"))?;
//! workflow.link("fetch", "publish")?;
//!
//! // Register job bodies and start a worker.
//! let worker = Worker::new(store.clone(), "worker-1");
//! worker
//!     .register_fn("FetchJob", |_job| async { Outcome::success("rows") })
//!     .await;
//! worker
//!     .register_fn("PublishJob", |job| async move {
//!         // Upstream outputs arrive as payloads, freshest state wins.
//!         Outcome::success(job.payloads.len())
//!     })
//!     .await;
//!
//! Scheduler::new(store).create_and_start(&workflow).await?;
//! let handle = worker.start().await;
//! // ... workers drain the queue ...
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! Each module hides one design decision:
//!
//! - [`core`]: the job record, its lifecycle, and the outcome taxonomy
//! - [`graph`]: DAG structure and validation
//! - [`storage`]: the store/queue gateway and its backends
//! - [`executor`]: the worker state machine, fan-out, and scheduling
//!
//! # Delivery Semantics
//!
//! The queue is at-least-once and readiness checks are not serialized:
//! a dependent with several upstreams may be enqueued more than once when
//! two workers finish its last two upstreams concurrently. Job bodies
//! must therefore be safe to run repeatedly; in exchange, no completion
//! is ever lost and no lock spans a workflow.

pub mod core;
pub mod executor;
pub mod graph;
pub mod storage;

// Re-export commonly used types for convenience
pub use core::{
    deserialize_value, serialize_value, BoxError, CoreError, Job, JobParams, JobState, LoopOpts,
    Outcome, Payload, Result as CoreResult, RetryPolicy,
};

pub use executor::{
    JobHandler, Registry, Result as ExecutionResult, Scheduler, Worker, WorkerError, WorkerHandle,
};

pub use graph::{GraphError, GraphResult, Workflow};

pub use storage::{ExecutionRequest, InMemoryStore, Result as StorageResult, Store, StorageError};

#[cfg(feature = "redis")]
pub use storage::RedisStore;

// Re-export dependencies that appear in the public API, so users don't
// hit version mismatches.
pub use serde_json;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use spate::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{
        BoxError, CoreError, Job, JobParams, JobState, LoopOpts, Outcome, Payload, RetryPolicy,
    };

    pub use crate::executor::{JobHandler, Registry, Scheduler, Worker, WorkerError, WorkerHandle};

    pub use crate::graph::{GraphError, Workflow};

    pub use crate::storage::{ExecutionRequest, InMemoryStore, Store, StorageError};

    #[cfg(feature = "redis")]
    pub use crate::storage::RedisStore;

    // Commonly used external types
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
