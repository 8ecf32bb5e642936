//! Poll registrations.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::cancel::KickSignal;
use crate::task::Task;

/// A predicate a worker uses to decide which pending tasks it can execute.
pub type Filter<P> = Box<dyn Fn(&Task<P>) -> bool + Send + Sync>;

/// A registered `poll` call, waiting to be matched against a pending task.
pub struct Worker<P> {
    pub agent_id: String,
    filter: Filter<P>,
    slot: oneshot::Sender<Task<P>>,
    pub kick: Arc<KickSignal>,
}

impl<P> Worker<P> {
    /// Create a worker and the two handles its registering `poll` call needs:
    /// the receiving half of its delivery slot, and its kick signal.
    pub fn new(
        agent_id: impl Into<String>,
        filter: Filter<P>,
    ) -> (Self, oneshot::Receiver<Task<P>>, Arc<KickSignal>) {
        let (slot, slot_rx) = oneshot::channel();
        let kick = Arc::new(KickSignal::new());
        let worker = Self {
            agent_id: agent_id.into(),
            filter,
            slot,
            kick: Arc::clone(&kick),
        };
        (worker, slot_rx, kick)
    }

    pub fn matches(&self, task: &Task<P>) -> bool {
        (self.filter)(task)
    }

    /// Consume the worker, handing `task` into its delivery slot. Fails only
    /// if the `poll` call that registered this worker has already been
    /// dropped (its future was abandoned without going through cancellation).
    pub fn deliver(self, task: Task<P>) -> Result<(), Task<P>> {
        self.slot.send(task)
    }
}
