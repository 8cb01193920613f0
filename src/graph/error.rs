use thiserror::Error;

/// Errors from workflow graph construction and validation.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum GraphError {
    /// A job with this name already exists in the workflow.
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    /// An edge references a job name that is not in the workflow.
    #[error("unknown job in dependency: {0}")]
    UnknownJob(String),

    /// The dependency edges form a cycle.
    #[error("dependency cycle involving jobs: {0:?}")]
    Cycle(Vec<String>),
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;
