//! The tagged result a job body hands back to the worker.
//!
//! Classification is data, not control flow: a body returns exactly one
//! `Outcome` variant and the worker dispatches on it. This replaces the
//! catch-typed-exceptions style of signaling soft failures and loop
//! retries.

use serde_json::Value;
use std::time::Duration;

/// A boxed error that can be sent across threads.
///
/// The standard error type of the async Rust ecosystem; any error
/// implementing `std::error::Error` converts into it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one job body invocation.
#[derive(Debug)]
pub enum Outcome {
    /// The job completed; the value becomes the record's `output` and is
    /// visible to downstream payloads.
    Success(Value),

    /// Deliberate terminal business failure. Recorded as `Failed(soft)`,
    /// acknowledged, never redelivered.
    SoftFailure,

    /// Run this job again later. Not a failure: the worker converts it
    /// into a delayed re-enqueue, bounded by the job's `loop_opts`
    /// deadline. `interval` overrides the configured loop interval when
    /// set.
    LoopRetry { interval: Option<Duration> },

    /// Hard failure. The worker checks the retry budget and either
    /// re-enqueues or records a terminal failure, then propagates.
    Error(BoxError),
}

impl Outcome {
    /// Success with any serializable output value.
    ///
    /// Serialization of an output value is infallible for the JSON types
    /// job bodies produce; a non-representable value (e.g. a map with
    /// non-string keys) is reported as a hard failure rather than a panic.
    pub fn success<T: serde::Serialize>(output: T) -> Self {
        match serde_json::to_value(output) {
            Ok(value) => Outcome::Success(value),
            Err(e) => Outcome::Error(Box::new(e)),
        }
    }

    /// Loop retry after the configured `loop_opts.interval`.
    pub fn loop_retry() -> Self {
        Outcome::LoopRetry { interval: None }
    }

    /// Loop retry with an explicit interval for this round only.
    pub fn loop_after(interval: Duration) -> Self {
        Outcome::LoopRetry {
            interval: Some(interval),
        }
    }

    /// Hard failure from any error type.
    pub fn error(cause: impl Into<BoxError>) -> Self {
        Outcome::Error(cause.into())
    }
}
