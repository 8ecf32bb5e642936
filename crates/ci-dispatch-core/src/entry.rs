//! Lease records.
//!
//! A single watched value: exactly one writer (whichever of `finish` or the
//! expiry sweep runs first), any number of readers, including ones that
//! subscribe *after* the value was written.

use std::time::Instant;

use tokio::sync::watch;

use crate::task::{Task, TaskOutcome};

/// A lease: the right for a worker to execute `task` until `deadline`.
pub struct Entry<P> {
    pub task: Task<P>,
    pub deadline: Instant,
    done_tx: watch::Sender<Option<TaskOutcome>>,
    done_rx: watch::Receiver<Option<TaskOutcome>>,
}

impl<P> Entry<P> {
    pub fn new(task: Task<P>, deadline: Instant) -> Self {
        let (done_tx, done_rx) = watch::channel(None);
        Self {
            task,
            deadline,
            done_tx,
            done_rx,
        }
    }

    /// A receiver that observes this lease's outcome once it is set, even if
    /// it subscribes after the fact.
    pub fn subscribe(&self) -> watch::Receiver<Option<TaskOutcome>> {
        self.done_rx.clone()
    }

    /// Resolve the lease. A second call is a no-op: `watch::Sender::send`
    /// overwrites the value, but nothing in this crate ever calls `finish`
    /// twice on the same entry: it is removed from `running` first.
    pub fn finish(&self, outcome: TaskOutcome) {
        let _ = self.done_tx.send(Some(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn late_subscriber_observes_stored_outcome() {
        let entry = Entry::new(Task::new("a", ()), Instant::now() + Duration::from_secs(1));
        entry.finish(TaskOutcome::Success);

        // Subscribing after finish() still sees the value immediately.
        let rx = entry.subscribe();
        assert_eq!(*rx.borrow(), Some(TaskOutcome::Success));
    }

    #[tokio::test]
    async fn subscriber_wakes_on_finish() {
        let entry = Entry::new(Task::new("a", ()), Instant::now() + Duration::from_secs(1));
        let mut rx = entry.subscribe();
        assert!(rx.borrow().is_none());

        entry.finish(TaskOutcome::Failure("boom".into()));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(TaskOutcome::Failure("boom".into())));
    }
}
