//! Task identity and dependency-status tracking.
//!
//! A [`Task`] is opaque to the queue beyond its id, its dependency list, and
//! the `dep_status` map the dispatcher fills in as prerequisites finish.
//! Everything else (labels, a build script, whatever a caller wants to match
//! workers against) lives in the generic `payload` field, which the core
//! never inspects itself.

use std::collections::HashMap;

/// Globally unique task identifier.
pub type TaskId = String;

/// The final outcome of a task, as observed by its dependents' `dep_status`
/// map and by [`crate::Queue::wait`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TaskOutcome {
    /// The task finished via `done`.
    Success,
    /// The task finished via `error`/`error_at_once`. The message is the
    /// caller-supplied error text; dependents only ever see the coarse
    /// `Failure` outcome, not the text, matching the source design's
    /// intentional coarsening (see DESIGN.md).
    Failure(String),
    /// The task was marked skipped (reserved for branch-policy callers that
    /// want a third outcome besides pass/fail).
    Skipped,
    /// The task's lease expired before it reported a result and has been
    /// resubmitted to the front of the pending queue. Not a failure: the
    /// task itself has not finished, only this particular lease has.
    Expired,
}

/// A unit of work tracked by the queue.
///
/// `P` is the caller's opaque payload/label type; the core only ever hands
/// it to a worker's filter predicate and otherwise leaves it untouched.
#[derive(Clone)]
pub struct Task<P> {
    pub id: TaskId,
    /// Set by the dispatcher the moment a task is matched to a worker.
    pub agent_id: Option<String>,
    pub dependencies: Vec<TaskId>,
    /// Populated incrementally as prerequisites finish, regardless of
    /// whether this task has itself been dispatched yet.
    pub dep_status: HashMap<TaskId, TaskOutcome>,
    pub payload: P,
}

impl<P> Task<P> {
    /// Create a task with no dependencies.
    pub fn new(id: impl Into<TaskId>, payload: P) -> Self {
        Self {
            id: id.into(),
            agent_id: None,
            dependencies: Vec::new(),
            dep_status: HashMap::new(),
            payload,
        }
    }

    /// Attach a dependency list (builder-style).
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }
}

// `P` is deliberately not required to implement `Debug`: it is an opaque
// payload and may be anything the caller likes.
impl<P> std::fmt::Debug for Task<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("dependencies", &self.dependencies)
            .field("dep_status", &self.dep_status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_has_no_dependencies_or_agent() {
        let task = Task::new("a", ());
        assert_eq!(task.id, "a");
        assert!(task.agent_id.is_none());
        assert!(task.dependencies.is_empty());
        assert!(task.dep_status.is_empty());
    }

    #[test]
    fn with_dependencies_preserves_order() {
        let task = Task::new("c", ()).with_dependencies(["a", "b"]);
        assert_eq!(task.dependencies, vec!["a".to_string(), "b".to_string()]);
    }
}
