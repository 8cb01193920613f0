use crate::core::BoxError;
use crate::graph::GraphError;
use crate::storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Executor layer error type.
///
/// The two hard-failure variants carry the propagation contract: a
/// [`Failed`](WorkerError::Failed) job has been re-marked Enqueued and the
/// queue should redeliver the request with its own backoff; an
/// [`Exhausted`](WorkerError::Exhausted) job is terminally Failed in the
/// store and the error exists only for the queue's bookkeeping and
/// alerting; redelivery is pointless but harmless.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// A storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A workflow failed graph validation.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// The execution request names a job that is not in the store.
    #[error("job not found: workflow={workflow_id}, job={name}")]
    JobNotFound { workflow_id: Uuid, name: String },

    /// Hard failure with retries remaining; the record is Enqueued again.
    #[error("job '{name}' failed, awaiting redelivery: {source}")]
    Failed {
        name: String,
        #[source]
        source: BoxError,
    },

    /// Hard failure with the retry budget exhausted; the record is
    /// terminally Failed.
    #[error("job '{name}' failed permanently after {attempts} attempt(s): {source}")]
    Exhausted {
        name: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },
}

pub type Result<T> = std::result::Result<T, WorkerError>;
