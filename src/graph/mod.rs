//! Workflow DAG structures.
//!
//! The graph module hides the topology representation: job records carry
//! their own bidirectional edge name lists, and [`Workflow`] owns the set
//! plus validation (duplicate names, dangling edges, cycles).

mod error;
mod workflow;

pub use error::{GraphError, GraphResult};
pub use workflow::Workflow;
