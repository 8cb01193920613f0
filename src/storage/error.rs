use crate::core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer error type for the spate orchestration layer.
///
/// Wraps backend and serialization errors while preserving the full error
/// chain for debugging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The requested job was not found in storage.
    #[error("job not found: workflow={workflow_id}, job={name}")]
    JobNotFound { workflow_id: Uuid, name: String },

    /// The requested workflow was not found in storage.
    #[error("workflow not found: id={0}")]
    WorkflowNotFound(Uuid),

    /// A Redis operation failed.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to reach the backend or obtain a connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend does not implement this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
