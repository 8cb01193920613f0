//! Core types for the spate orchestration layer.
//!
//! This module provides the building blocks the rest of the crate is
//! assembled from:
//!
//! # Domain Model
//! - [`Job`]: the persisted state of one DAG node
//! - [`JobState`]: the lifecycle state (Pending, Enqueued, Running, Finished, Failed)
//! - [`Payload`]: one upstream output handed to a job body
//! - [`Outcome`]: the tagged result a job body returns
//!
//! # Retry Behavior
//! - [`RetryPolicy`]: attempt budget and backoff schedule for hard failures
//!
//! # Serialization
//! - [`serialize_value`] / [`deserialize_value`]: JSON byte conversion for
//!   storage backends
//!
//! # Error Handling
//! - [`CoreError`] and its [`Result<T>`] alias

mod error;
mod job;
mod outcome;
pub mod retry;
mod serialization;

pub use error::{CoreError, Result};
pub use job::{Job, JobParams, JobState, LoopOpts, Payload};
pub use outcome::{BoxError, Outcome};
pub use retry::RetryPolicy;
pub use serialization::{deserialize_value, serialize_value};
