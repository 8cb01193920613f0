//! Workflow - the DAG of named job nodes.
//!
//! A workflow owns the set of job records sharing one workflow id and the
//! dependency edges between them. The topology is fixed once defined:
//! workers mutate per-job state, never the graph.
//!
//! # Design
//!
//! Edges live on the job records themselves as bidirectional name lists
//! (`incoming`/`outgoing`), which gives O(1) access to both dependencies
//! and dependents. The workflow keeps an insertion-order vector alongside
//! the name map so iteration is deterministic.

use super::error::{GraphError, GraphResult};
use crate::core::Job;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// A directed acyclic graph of job records sharing one workflow id.
///
/// # Example
///
/// ```
/// use spate::{Job, Workflow};
///
/// let mut workflow = Workflow::new();
/// workflow.add_job(Job::new("fetch", "FetchJob")).unwrap();
/// workflow.add_job(Job::new("normalize", "NormalizeJob")).unwrap();
/// workflow.add_job(Job::new("publish", "PublishJob")).unwrap();
///
/// workflow.link("fetch", "normalize").unwrap();
/// workflow.link("normalize", "publish").unwrap();
///
/// workflow.validate().unwrap();
/// assert_eq!(workflow.initial_jobs().len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    id: Uuid,
    jobs: HashMap<String, Job>,
    /// Insertion order for deterministic iteration.
    insertion_order: Vec<String>,
}

impl Workflow {
    /// Creates an empty workflow with a fresh id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Creates an empty workflow with the given id.
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            jobs: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Rebuilds a workflow from persisted job records.
    ///
    /// The records' own edge lists are trusted; call [`validate`] after
    /// reconstructing from an untrusted source.
    ///
    /// [`validate`]: Workflow::validate
    pub fn from_jobs(id: Uuid, jobs: Vec<Job>) -> Self {
        let mut workflow = Self::with_id(id);
        for job in jobs {
            workflow.insertion_order.push(job.name.clone());
            workflow.jobs.insert(job.name.clone(), job);
        }
        workflow
    }

    /// Returns the workflow id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the number of jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the workflow has no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Adds a job node.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::DuplicateJob` if a job with this name already
    /// exists.
    pub fn add_job(&mut self, job: Job) -> GraphResult<()> {
        if self.jobs.contains_key(&job.name) {
            return Err(GraphError::DuplicateJob(job.name.clone()));
        }
        self.insertion_order.push(job.name.clone());
        self.jobs.insert(job.name.clone(), job);
        Ok(())
    }

    /// Declares that `downstream` depends on `upstream`.
    ///
    /// Wires the upstream's `outgoing` and the downstream's `incoming`
    /// lists. Re-declaring an existing edge is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::UnknownJob` if either name is not in the
    /// workflow.
    pub fn link(&mut self, upstream: &str, downstream: &str) -> GraphResult<()> {
        if !self.jobs.contains_key(upstream) {
            return Err(GraphError::UnknownJob(upstream.to_string()));
        }
        if !self.jobs.contains_key(downstream) {
            return Err(GraphError::UnknownJob(downstream.to_string()));
        }

        let up = self.jobs.get_mut(upstream).expect("checked above");
        if !up.outgoing.iter().any(|n| n == downstream) {
            up.outgoing.push(downstream.to_string());
        }
        let down = self.jobs.get_mut(downstream).expect("checked above");
        if !down.incoming.iter().any(|n| n == upstream) {
            down.incoming.push(upstream.to_string());
        }
        Ok(())
    }

    /// Returns the job with the given name.
    pub fn get(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    /// Iterates over jobs in insertion order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.insertion_order
            .iter()
            .filter_map(move |name| self.jobs.get(name))
    }

    /// Jobs with no upstream dependencies, in insertion order.
    ///
    /// These are the entry points a scheduler enqueues to start the
    /// workflow.
    pub fn initial_jobs(&self) -> Vec<&Job> {
        self.jobs().filter(|job| job.incoming.is_empty()).collect()
    }

    /// Checks the graph for dangling edge names and cycles.
    ///
    /// Cycle detection is Kahn's algorithm: repeatedly remove nodes with
    /// no unprocessed incoming edges; anything left over sits on a cycle.
    pub fn validate(&self) -> GraphResult<()> {
        // Records deserialized from storage may carry edges the builder
        // never checked.
        for job in self.jobs.values() {
            for name in job.incoming.iter().chain(job.outgoing.iter()) {
                if !self.jobs.contains_key(name) {
                    return Err(GraphError::UnknownJob(name.clone()));
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = self
            .jobs
            .values()
            .map(|job| (job.name.as_str(), job.incoming.len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .insertion_order
            .iter()
            .filter(|name| in_degree.get(name.as_str()) == Some(&0))
            .map(String::as_str)
            .collect();

        let mut visited = 0usize;
        while let Some(name) = queue.pop_front() {
            visited += 1;
            let job = &self.jobs[name];
            for next in &job.outgoing {
                let degree = in_degree.get_mut(next.as_str()).expect("checked above");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next.as_str());
                }
            }
        }

        if visited != self.jobs.len() {
            let mut remaining: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            remaining.sort();
            return Err(GraphError::Cycle(remaining));
        }
        Ok(())
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Workflow {
        let mut workflow = Workflow::new();
        workflow.add_job(Job::new("a", "A")).unwrap();
        workflow.add_job(Job::new("b", "B")).unwrap();
        workflow.add_job(Job::new("c", "C")).unwrap();
        workflow.add_job(Job::new("d", "D")).unwrap();
        workflow.link("a", "b").unwrap();
        workflow.link("a", "c").unwrap();
        workflow.link("b", "d").unwrap();
        workflow.link("c", "d").unwrap();
        workflow
    }

    #[test]
    fn test_add_job_rejects_duplicates() {
        let mut workflow = Workflow::new();
        workflow.add_job(Job::new("a", "A")).unwrap();
        assert_eq!(
            workflow.add_job(Job::new("a", "A")),
            Err(GraphError::DuplicateJob("a".to_string()))
        );
    }

    #[test]
    fn test_link_wires_both_directions() {
        let workflow = diamond();
        assert_eq!(workflow.get("a").unwrap().outgoing, vec!["b", "c"]);
        assert_eq!(workflow.get("d").unwrap().incoming, vec!["b", "c"]);
    }

    #[test]
    fn test_link_unknown_job() {
        let mut workflow = Workflow::new();
        workflow.add_job(Job::new("a", "A")).unwrap();
        assert_eq!(
            workflow.link("a", "ghost"),
            Err(GraphError::UnknownJob("ghost".to_string()))
        );
    }

    #[test]
    fn test_link_is_idempotent() {
        let mut workflow = Workflow::new();
        workflow.add_job(Job::new("a", "A")).unwrap();
        workflow.add_job(Job::new("b", "B")).unwrap();
        workflow.link("a", "b").unwrap();
        workflow.link("a", "b").unwrap();
        assert_eq!(workflow.get("a").unwrap().outgoing, vec!["b"]);
        assert_eq!(workflow.get("b").unwrap().incoming, vec!["a"]);
    }

    #[test]
    fn test_initial_jobs() {
        let workflow = diamond();
        let initial: Vec<&str> = workflow
            .initial_jobs()
            .iter()
            .map(|job| job.name.as_str())
            .collect();
        assert_eq!(initial, vec!["a"]);
    }

    #[test]
    fn test_validate_accepts_dag() {
        diamond().validate().unwrap();
    }

    #[test]
    fn test_validate_detects_cycle() {
        let mut workflow = Workflow::new();
        workflow.add_job(Job::new("a", "A")).unwrap();
        workflow.add_job(Job::new("b", "B")).unwrap();
        workflow.add_job(Job::new("c", "C")).unwrap();
        workflow.link("a", "b").unwrap();
        workflow.link("b", "c").unwrap();
        workflow.link("c", "a").unwrap();

        match workflow.validate() {
            Err(GraphError::Cycle(names)) => {
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_jobs_iterate_in_insertion_order() {
        let workflow = diamond();
        let names: Vec<&str> = workflow.jobs().map(|job| job.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_from_jobs_round_trip() {
        let workflow = diamond();
        let jobs: Vec<Job> = workflow.jobs().cloned().collect();
        let rebuilt = Workflow::from_jobs(workflow.id(), jobs);
        assert_eq!(rebuilt.len(), 4);
        rebuilt.validate().unwrap();
    }
}
