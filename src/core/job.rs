//! The persisted job record: one DAG node and its lifecycle state.
//!
//! A `Job` is the unit of shared mutable state in the system. Workers load
//! it, advance it through its lifecycle, and write it back with a
//! best-effort overwrite; there is no compare-and-swap. Everything that
//! must survive a worker crash lives here.

use crate::core::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Lifecycle state of a job within its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Defined in the DAG but not yet submitted to the queue.
    Pending,
    /// An execution request for this job has been submitted.
    Enqueued,
    /// A worker has started the job body.
    Running,
    /// The body completed successfully; `output` is set.
    Finished,
    /// Terminal failure. `soft` distinguishes a deliberate business
    /// failure from an exhausted or expired hard failure.
    Failed { soft: bool },
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Enqueued => write!(f, "ENQUEUED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Finished => write!(f, "FINISHED"),
            JobState::Failed { soft: true } => write!(f, "FAILED(soft)"),
            JobState::Failed { soft: false } => write!(f, "FAILED"),
        }
    }
}

/// One upstream output handed to a job body.
///
/// Assembled fresh on every attempt from the current store state, in the
/// stored order of the job's `incoming` edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Name of the upstream job.
    pub id: String,
    /// Class of the upstream job.
    pub class: String,
    /// Output the upstream produced, if it has finished.
    pub output: Option<Value>,
}

/// Recurrence bounds for a looping job.
///
/// A loop job re-enqueues itself every `interval` until it succeeds, hard
/// fails, or the wall-clock `end_time` passes. The deadline is evaluated
/// once per attempt; it is the only mechanism that stops a recurring job
/// early.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopOpts {
    /// Delay between loop attempts.
    pub interval: Duration,
    /// Attempts at or after this instant fail instead of running.
    pub end_time: DateTime<Utc>,
}

/// Per-job configuration carried on the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParams {
    /// Opaque user parameters, handed to the body unchanged.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Recurrence bounds; required for a body that requests loop retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_opts: Option<LoopOpts>,

    /// When set, a successful completion issues a workflow restart
    /// carrying this value verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_job: Option<Value>,

    /// Hard-failure retry budget. `None` means no retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Persisted state of one DAG node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier within the workflow.
    pub name: String,
    /// Handler class this job dispatches to.
    pub class: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Upstream job names (edges into this job).
    #[serde(default)]
    pub incoming: Vec<String>,
    /// Downstream job names (edges out of this job).
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Upstream outputs for the current attempt. Rebuilt on every attempt
    /// and never persisted; a retried body always observes the freshest
    /// upstream outputs.
    #[serde(skip)]
    pub payloads: Vec<Payload>,
    /// Output recorded on successful completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Job configuration.
    #[serde(default)]
    pub params: JobParams,
    /// Number of times a worker has started this job.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job with no edges.
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            state: JobState::Pending,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            payloads: Vec::new(),
            output: None,
            params: JobParams::default(),
            attempts: 0,
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            failed_at: None,
        }
    }

    /// Creates a pending job with the given configuration.
    pub fn with_params(name: impl Into<String>, class: impl Into<String>, params: JobParams) -> Self {
        let mut job = Self::new(name, class);
        job.params = params;
        job
    }

    // ------------------------------------------------------------------
    // Transitions
    //
    // Each transition is a plain overwrite of `state` plus its timestamp.
    // Callers persist the record afterwards; applying a transition to a
    // record that is already past it must stay safe under at-least-once
    // delivery.
    // ------------------------------------------------------------------

    /// Marks the job as submitted to the queue.
    pub fn mark_enqueued(&mut self) {
        self.state = JobState::Enqueued;
        self.enqueued_at = Some(Utc::now());
    }

    /// Marks the job as running and counts the attempt.
    pub fn mark_started(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Marks the job as successfully finished.
    pub fn mark_finished(&mut self) {
        self.state = JobState::Finished;
        self.finished_at = Some(Utc::now());
    }

    /// Marks the job as terminally failed.
    pub fn mark_failed(&mut self, soft: bool) {
        self.state = JobState::Failed { soft };
        self.failed_at = Some(Utc::now());
    }

    /// Returns the record to a fresh Pending state, keeping its topology
    /// and configuration. Used by workflow restarts.
    pub fn reset(&mut self) {
        self.state = JobState::Pending;
        self.payloads.clear();
        self.output = None;
        self.attempts = 0;
        self.enqueued_at = None;
        self.started_at = None;
        self.finished_at = None;
        self.failed_at = None;
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    pub fn pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn enqueued(&self) -> bool {
        self.state == JobState::Enqueued
    }

    pub fn running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn finished(&self) -> bool {
        self.state == JobState::Finished
    }

    pub fn failed(&self) -> bool {
        matches!(self.state, JobState::Failed { .. })
    }

    pub fn failed_softly(&self) -> bool {
        self.state == JobState::Failed { soft: true }
    }

    /// True when the loop deadline has passed.
    ///
    /// Always false for jobs without `loop_opts`.
    pub fn expired(&self) -> bool {
        self.expired_at(Utc::now())
    }

    /// Deadline check against an explicit clock, for callers that already
    /// hold a timestamp.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.params.loop_opts {
            Some(opts) => now >= opts.end_time,
            None => false,
        }
    }

    /// Configured delay between loop attempts, if any.
    pub fn loop_interval(&self) -> Option<Duration> {
        self.params.loop_opts.map(|opts| opts.interval)
    }

    /// The hard-failure retry budget, defaulting to no retries.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.params.retry.unwrap_or(RetryPolicy::NONE)
    }

    /// True once the current attempt count has consumed the retry budget.
    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.retry_policy().max_attempts
    }
}
