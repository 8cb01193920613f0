//! Registry mapping job classes to their handlers.
//!
//! A job record names its behavior through its `class` field; the registry
//! resolves that name to the user-supplied body at execution time. This is
//! the seam between the orchestration core and business logic.

use crate::core::{Job, Outcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A user-supplied job body.
///
/// The handler receives the current job record (including the freshly
/// assembled `payloads`) and reports exactly one [`Outcome`]. Handlers
/// must tolerate repeat invocations: delivery is at-least-once and
/// dependent fan-out can duplicate under worker races.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, job: &Job) -> Outcome;
}

/// Adapter that lets plain async closures act as handlers.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send,
{
    async fn perform(&self, job: &Job) -> Outcome {
        (self.0)(job.clone()).await
    }
}

/// Registry of job handlers keyed by class name.
///
/// Handlers sit behind `Arc` so a worker can clone one out under a brief
/// lock and invoke it without holding the registry for the duration of the
/// body.
///
/// # Example
///
/// ```
/// use spate::executor::Registry;
/// use spate::Outcome;
///
/// let mut registry = Registry::new();
/// registry.register_fn("EchoJob", |job| async move {
///     Outcome::success(job.params.data)
/// });
/// assert_eq!(registry.len(), 1);
/// ```
pub struct Registry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for a job class.
    ///
    /// Re-registering a class replaces the previous handler.
    pub fn register<H>(&mut self, class: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(class.into(), Arc::new(handler));
    }

    /// Registers an async closure as the handler for a job class.
    pub fn register_fn<F, Fut>(&mut self, class: impl Into<String>, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.register(class, FnHandler(f));
    }

    /// Resolves a handler by class name. The clone is cheap and lets the
    /// caller release any lock before executing.
    pub fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(class).cloned()
    }

    /// Returns the number of registered classes.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no classes are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let mut registry = Registry::new();
        registry.register_fn("DoubleJob", |job| async move {
            let n = job.params.data.as_i64().unwrap_or(0);
            Outcome::success(n * 2)
        });

        let handler = registry.get("DoubleJob").unwrap();
        let mut job = Job::new("double", "DoubleJob");
        job.params.data = serde_json::json!(21);

        match handler.perform(&job).await {
            Outcome::Success(value) => assert_eq!(value, serde_json::json!(42)),
            other => panic!("expected Success, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_class() {
        let registry = Registry::new();
        assert!(registry.get("GhostJob").is_none());
        assert!(registry.is_empty());
    }
}
