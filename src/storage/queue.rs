//! Queue types for distributed job execution.
//!
//! An [`ExecutionRequest`] is the at-least-once message a queue delivers to
//! a worker: run this `(workflow_id, job_name)` pair once. The same pair
//! may be delivered more than once, possibly concurrently with itself or
//! with requests for sibling nodes; workers must tolerate both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One execution request submitted to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique identifier for this request.
    pub request_id: Uuid,
    /// Workflow the job belongs to.
    pub workflow_id: Uuid,
    /// Name of the job to run.
    pub job_name: String,
    /// Earliest instant the request may be delivered.
    pub run_at: DateTime<Utc>,
    /// Times the queue has delivered this request. This is the
    /// infrastructure's own retry budget, separate from the job record's
    /// `attempts` bookkeeping.
    pub deliveries: u32,
    /// When this request was created.
    pub created_at: DateTime<Utc>,
}

impl ExecutionRequest {
    /// Creates a request deliverable immediately.
    pub fn new(workflow_id: Uuid, job_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4(),
            workflow_id,
            job_name: job_name.into(),
            run_at: now,
            deliveries: 0,
            created_at: now,
        }
    }

    /// Creates a request deliverable after `delay`.
    pub fn delayed(workflow_id: Uuid, job_name: impl Into<String>, delay: Duration) -> Self {
        let mut request = Self::new(workflow_id, job_name);
        request.run_at = run_after(request.created_at, delay);
        request
    }

    /// True once the request's delivery time has arrived.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }
}

/// Adds a delay to a timestamp, saturating instead of overflowing on
/// absurd delays.
pub(crate) fn run_after(from: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_is_due() {
        let request = ExecutionRequest::new(Uuid::new_v4(), "fetch");
        assert!(request.due(Utc::now()));
        assert_eq!(request.deliveries, 0);
    }

    #[test]
    fn test_delayed_request_is_not_due_yet() {
        let request =
            ExecutionRequest::delayed(Uuid::new_v4(), "fetch", Duration::from_secs(60));
        assert!(!request.due(Utc::now()));
        assert!(request.due(Utc::now() + chrono::Duration::seconds(61)));
    }
}
