//! Execution engine: the worker core and its surrounding plumbing.
//!
//! - [`Worker`]: the per-job state machine, readiness fan-out, and the
//!   background polling loop
//! - [`Registry`] / [`JobHandler`]: the seam where user job bodies plug in
//! - [`Scheduler`]: persists workflows and enqueues their initial jobs
//! - [`WorkerError`]: the propagation contract back to the queue layer

mod error;
mod registry;
mod scheduler;
mod worker;

pub use error::{Result, WorkerError};
pub use registry::{JobHandler, Registry};
pub use scheduler::Scheduler;
pub use worker::{Worker, WorkerHandle};
