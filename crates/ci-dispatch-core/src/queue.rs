//! The dispatcher: matchmaking, dependency gating, and lease management,
//! plus the public `Queue<P>` API.
//!
//! One procedure drains expired work, re-admits blocked work, and matches
//! the rest against available workers, all under one lock. It runs
//! synchronously inside whichever public method triggered it rather than in
//! a separate background task; see DESIGN.md.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::cancel::KickReason;
use crate::config::QueueConfig;
use crate::entry::Entry;
pub use crate::error::{Cancelled, DispatchError};
use crate::task::{Task, TaskId, TaskOutcome};
use crate::worker::{Filter, Worker};

/// Why [`Queue::poll`] returned without a task.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The caller-supplied cancellation future resolved first.
    #[error("poll cancelled")]
    Cancelled,
    /// `kick_agent_workers` removed this worker before it was matched.
    #[error("worker kicked: {0:?}")]
    Kicked(KickReason),
}

/// Point-in-time snapshot of the queue, returned by [`Queue::info`].
///
/// Every task here is a clone; mutating the returned structures has no
/// effect on the live queue.
#[derive(Debug, Clone)]
pub struct QueueInfo<P> {
    pub pending: Vec<Task<P>>,
    pub waiting_on_deps: Vec<Task<P>>,
    pub running: Vec<Task<P>>,
    pub worker_count: usize,
    pub paused: bool,
}

struct QueueState<P> {
    pending: VecDeque<Task<P>>,
    waiting_on_deps: VecDeque<Task<P>>,
    running: HashMap<TaskId, Entry<P>>,
    workers: Vec<Worker<P>>,
    extension: Duration,
    paused: bool,
}

impl<P> QueueState<P> {
    fn new(extension: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            waiting_on_deps: VecDeque::new(),
            running: HashMap::new(),
            workers: Vec::new(),
            extension,
            paused: false,
        }
    }
}

/// The task dispatch core.
///
/// Cheaply cloneable (`Arc`-backed); every clone shares the same underlying
/// state and the same `std::sync::Mutex`. A `std` mutex rather than a tokio
/// one is deliberate: no branch of the dispatcher ever awaits while holding
/// it, so there is nothing for an async executor to block on.
pub struct Queue<P> {
    state: Arc<Mutex<QueueState<P>>>,
}

impl<P> Clone for Queue<P> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<P> Default for Queue<P> {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl<P> Queue<P> {
    /// Create an empty queue with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::new(config.extension()))),
        }
    }

    /// Append a task to the tail of `pending` and run a dispatch pass.
    /// Never fails and never blocks on worker availability.
    pub fn push(&self, task: Task<P>)
    where
        P: Clone,
    {
        let mut state = self.state.lock().unwrap();
        trace!(task_id = %task.id, "task pushed");
        state.pending.push_back(task);
        dispatch(&mut state);
    }

    /// Append a batch of tasks, preserving their relative order, then run a
    /// single dispatch pass over the whole batch.
    pub fn push_at_once(&self, tasks: impl IntoIterator<Item = Task<P>>)
    where
        P: Clone,
    {
        let mut state = self.state.lock().unwrap();
        for task in tasks {
            trace!(task_id = %task.id, "task pushed (batch)");
            state.pending.push_back(task);
        }
        dispatch(&mut state);
    }

    /// Register a worker and wait for a matching task.
    ///
    /// `cancel` races the delivery slot and the administrative kick signal;
    /// any `Future<Output = ()>` works, including a
    /// [`crate::cancel::CancelToken::cancelled`] call.
    pub async fn poll(
        &self,
        agent_id: impl Into<String>,
        filter: Filter<P>,
        cancel: impl Future<Output = ()>,
    ) -> Result<Task<P>, PollError>
    where
        P: Clone,
    {
        let (worker, slot, kick) = Worker::new(agent_id, filter);
        let agent_id_log = worker.agent_id.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.workers.push(worker);
            dispatch(&mut state);
        }

        tokio::pin!(cancel);
        tokio::pin!(slot);
        loop {
            tokio::select! {
                biased;
                result = &mut slot => {
                    return match result {
                        Ok(task) => {
                            debug!(agent_id = %agent_id_log, task_id = %task.id, "poll matched");
                            Ok(task)
                        }
                        Err(_) => {
                            // The sending half is only ever dropped after a
                            // successful `deliver`, or together with the
                            // worker itself when it is removed without being
                            // matched (kick / cancel), both of which resolve
                            // through the other branches first.
                            unreachable!("delivery slot dropped without delivering")
                        }
                    };
                }
                reason = kick.notified() => {
                    debug!(agent_id = %agent_id_log, "poll kicked");
                    return Err(PollError::Kicked(reason));
                }
                () = &mut cancel => {
                    let mut state = self.state.lock().unwrap();
                    state.workers.retain(|w| !Arc::ptr_eq(&w.kick, &kick));
                    debug!(agent_id = %agent_id_log, "poll cancelled");
                    return Err(PollError::Cancelled);
                }
            }
        }
    }

    /// Mark a task successful. Never fails; unknown ids are tolerated.
    pub fn done(&self, id: impl AsRef<str>)
    where
        P: Clone,
    {
        let mut state = self.state.lock().unwrap();
        finish(&mut state, std::slice::from_ref(&id.as_ref().to_string()), TaskOutcome::Success);
        dispatch(&mut state);
    }

    /// Mark a task failed. Never fails; unknown ids are tolerated.
    pub fn error(&self, id: impl AsRef<str>, message: impl Into<String>)
    where
        P: Clone,
    {
        let mut state = self.state.lock().unwrap();
        let outcome = TaskOutcome::Failure(message.into());
        finish(&mut state, std::slice::from_ref(&id.as_ref().to_string()), outcome);
        dispatch(&mut state);
    }

    /// Mark a batch of tasks failed with the same message in one locked pass,
    /// so their dependents observe a consistent snapshot.
    pub fn error_at_once<I, S>(&self, ids: I, message: impl Into<String>)
    where
        P: Clone,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<TaskId> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        let mut state = self.state.lock().unwrap();
        finish(&mut state, &ids, TaskOutcome::Failure(message.into()));
        dispatch(&mut state);
    }

    /// Remove the first pending task matching `id`. Does not touch `running`
    /// or `waiting_on_deps`: eviction is for pending-only cancellation.
    pub fn evict(&self, id: impl AsRef<str>) -> Result<(), DispatchError> {
        let mut state = self.state.lock().unwrap();
        evict_one(&mut state, id.as_ref())
    }

    /// Attempt to evict each id in order, stopping at the first successful
    /// removal; see DESIGN.md for why later ids in the list are left alone.
    pub fn evict_at_once<I, S>(&self, ids: I) -> Result<(), DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock().unwrap();
        let mut last_error = None;
        for id in ids {
            match evict_one(&mut state, id.as_ref()) {
                Ok(()) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| DispatchError::NotFound(String::new())))
    }

    /// Wait for a running task to finish. Returns `Ok(None)` immediately if
    /// `id` is not currently running (presumed already finished).
    pub async fn wait(
        &self,
        id: impl AsRef<str>,
        cancel: impl Future<Output = ()>,
    ) -> Result<Option<TaskOutcome>, Cancelled> {
        let rx = {
            let state = self.state.lock().unwrap();
            match state.running.get(id.as_ref()) {
                Some(entry) => entry.subscribe(),
                None => return Ok(None),
            }
        };

        tokio::pin!(cancel);
        let mut rx = rx;
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return Ok(Some(outcome));
            }
            tokio::select! {
                biased;
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(rx.borrow().clone());
                    }
                }
                () = &mut cancel => return Err(Cancelled),
            }
        }
    }

    /// Renew a running task's lease. Fails with `NotFound` if `id` is not
    /// running.
    pub fn extend(&self, id: impl AsRef<str>) -> Result<(), DispatchError> {
        let mut state = self.state.lock().unwrap();
        let extension = state.extension;
        let id = id.as_ref();
        match state.running.get_mut(id) {
            Some(entry) => {
                entry.deadline = Instant::now() + extension;
                Ok(())
            }
            None => Err(DispatchError::NotFound(id.to_string())),
        }
    }

    /// Snapshot the three queues, worker count, and paused flag.
    pub fn info(&self) -> QueueInfo<P>
    where
        P: Clone,
    {
        let state = self.state.lock().unwrap();
        QueueInfo {
            pending: state.pending.iter().cloned().collect(),
            waiting_on_deps: state.waiting_on_deps.iter().cloned().collect(),
            running: state.running.values().map(|entry| entry.task.clone()).collect(),
            worker_count: state.workers.len(),
            paused: state.paused,
        }
    }

    /// Stop assigning tasks to workers. Lease expiry still runs. Idempotent.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused = true;
    }

    /// Resume assigning tasks and run a dispatch pass. Idempotent.
    pub fn resume(&self)
    where
        P: Clone,
    {
        let mut state = self.state.lock().unwrap();
        state.paused = false;
        dispatch(&mut state);
    }

    /// Cancel every outstanding `poll` registered under `agent_id`, removing
    /// them from the worker registry.
    pub fn kick_agent_workers(&self, agent_id: &str) {
        let mut state = self.state.lock().unwrap();
        let matching: Vec<usize> = state
            .workers
            .iter()
            .enumerate()
            .filter(|(_, worker)| worker.agent_id == agent_id)
            .map(|(index, _)| index)
            .collect();

        for &index in matching.iter().rev() {
            let worker = state.workers.remove(index);
            worker.kick.fire(KickReason::AgentKicked);
        }

        if !matching.is_empty() {
            info!(agent_id, kicked = matching.len(), "kicked agent workers");
        }
    }

    /// Spawn a background task that forces a dispatch pass on a fixed
    /// interval, in addition to the event-driven passes every mutating call
    /// already runs. Covers the case where an agent dies and nobody calls
    /// `push`/`poll`/etc. again before an external caller needs the lease
    /// recovered. Purely additive: dropping the returned handle stops it.
    pub fn spawn_lease_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        P: Clone + Send + 'static,
    {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut state = queue.state.lock().unwrap();
                dispatch(&mut state);
            }
        })
    }
}

fn evict_one<P>(state: &mut QueueState<P>, id: &str) -> Result<(), DispatchError> {
    match state.pending.iter().position(|task| task.id == id) {
        Some(pos) => {
            state.pending.remove(pos);
            Ok(())
        }
        None => Err(DispatchError::NotFound(id.to_string())),
    }
}

/// The outcome-propagation + lease-resolution procedure shared by `done`,
/// `error`, and `error_at_once`.
fn finish<P>(state: &mut QueueState<P>, ids: &[TaskId], outcome: TaskOutcome) {
    for id in ids {
        if let Some(entry) = state.running.remove(id) {
            entry.finish(outcome.clone());
        } else if let Some(pos) = state.pending.iter().position(|task| &task.id == id) {
            // Completion raced dispatch: the caller finished a task that was
            // never (or no longer) leased. Simulate the race by removing it
            // from pending outright rather than leaving it dispatchable.
            state.pending.remove(pos);
        }
    }
    let dependent_view = dependent_facing(&outcome);
    propagate_dep_status(state, ids, &dependent_view);
}

/// The coarsened outcome dependents see in their own `dep_status`: pass,
/// fail, skip, or expired, never the error text. The text is not lost: it
/// reaches whoever is waiting on the failed task itself via `wait`.
fn dependent_facing(outcome: &TaskOutcome) -> TaskOutcome {
    match outcome {
        TaskOutcome::Failure(_) => TaskOutcome::Failure(String::new()),
        other => other.clone(),
    }
}

fn propagate_dep_status<P>(state: &mut QueueState<P>, finished_ids: &[TaskId], outcome: &TaskOutcome) {
    for task in state.pending.iter_mut().chain(state.waiting_on_deps.iter_mut()) {
        for id in finished_ids {
            if task.dependencies.iter().any(|dep| dep == id) {
                task.dep_status.insert(id.clone(), outcome.clone());
            }
        }
    }
    for entry in state.running.values_mut() {
        for id in finished_ids {
            if entry.task.dependencies.iter().any(|dep| dep == id) {
                entry.task.dep_status.insert(id.clone(), outcome.clone());
            }
        }
    }
}

/// Run one full dispatch pass: expire leases, re-admit waiting tasks, gate
/// on dependencies, then match. Steps 2-4 are skipped while paused.
fn dispatch<P: Clone>(state: &mut QueueState<P>) {
    let now = Instant::now();
    expire_leases(state, now);

    if state.paused {
        trace!("queue paused; skipping waiting re-admission and matching");
        return;
    }

    readmit_waiting(state);
    gate_dependencies(state);
    match_pending(state, now);
}

fn expire_leases<P>(state: &mut QueueState<P>, now: Instant) {
    let expired: Vec<TaskId> = state
        .running
        .iter()
        .filter(|(_, entry)| entry.deadline < now)
        .map(|(id, _)| id.clone())
        .collect();

    for id in expired {
        if let Some(entry) = state.running.remove(&id) {
            warn!(task_id = %id, "lease expired; resubmitting to front of pending");
            entry.finish(TaskOutcome::Expired);
            state.pending.push_front(entry.task);
        }
    }
}

fn readmit_waiting<P>(state: &mut QueueState<P>) {
    while let Some(task) = state.waiting_on_deps.pop_front() {
        state.pending.push_back(task);
    }
}

fn gate_dependencies<P>(state: &mut QueueState<P>) {
    let pending_ids: HashSet<TaskId> = state.pending.iter().map(|task| task.id.clone()).collect();
    let mut still_pending = VecDeque::with_capacity(state.pending.len());

    for task in state.pending.drain(..) {
        let blocked = task.dependencies.iter().any(|dep| {
            (dep != &task.id && pending_ids.contains(dep)) || state.running.contains_key(dep)
        });
        if blocked {
            trace!(task_id = %task.id, "task gated on unmet dependency");
            state.waiting_on_deps.push_back(task);
        } else {
            still_pending.push_back(task);
        }
    }

    state.pending = still_pending;
}

fn match_pending<P: Clone>(state: &mut QueueState<P>, now: Instant) {
    let mut index = 0;
    while index < state.pending.len() {
        let worker_index = {
            let task = &state.pending[index];
            state.workers.iter().position(|worker| worker.matches(task))
        };

        let Some(worker_index) = worker_index else {
            index += 1;
            continue;
        };

        let mut task = state.pending.remove(index).expect("index in bounds");
        let worker = state.workers.remove(worker_index);
        task.agent_id = Some(worker.agent_id.clone());

        let deadline = now + state.extension;
        let entry = Entry::new(task.clone(), deadline);
        state.running.insert(task.id.clone(), entry);

        debug!(task_id = %task.id, agent_id = %worker.agent_id, "task matched");
        if worker.deliver(task).is_err() {
            debug!("poll caller went away before delivery; lease stands until its deadline");
        }
        // Do not advance `index`: the element that shifted into this slot
        // has not been tried against any worker yet.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use std::time::Duration;

    fn accept_all() -> Filter<()> {
        Box::new(|_| true)
    }

    #[tokio::test]
    async fn straight_dispatch() {
        let queue: Queue<()> = Queue::default();
        queue.push(Task::new("a", ()));

        let cancel = CancelToken::new();
        let task = queue.poll("agent-1", accept_all(), cancel.cancelled()).await.unwrap();
        assert_eq!(task.id, "a");
        assert_eq!(task.agent_id.as_deref(), Some("agent-1"));

        queue.done("a");
        let info = queue.info();
        assert!(info.pending.is_empty());
        assert!(info.running.is_empty());
        assert_eq!(info.worker_count, 0);
    }

    #[tokio::test]
    async fn filter_miss_then_hit() {
        let queue: Queue<Vec<String>> = Queue::default();
        queue.push(Task::new("a", vec!["x".to_string()]));

        let cancel = CancelToken::new();
        let filter: Filter<Vec<String>> = Box::new(|t| !t.payload.contains(&"x".to_string()));
        let poll = queue.poll("agent-1", filter, cancel.cancelled());

        // The worker's filter rejects "a"; it should still be registered and
        // blocked, not failing outright.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.info().worker_count, 1);
        assert_eq!(queue.info().pending.len(), 1);

        queue.push(Task::new("b", vec![]));
        let task = poll.await.unwrap();
        assert_eq!(task.id, "b");
        assert_eq!(queue.info().pending[0].id, "a");
    }

    #[tokio::test]
    async fn dependency_gating_and_status_propagation() {
        let queue: Queue<()> = Queue::default();
        queue.push(Task::new("a", ()));
        queue.push(Task::new("b", ()).with_dependencies(["a"]));

        let cancel_a = CancelToken::new();
        let a = queue.poll("agent-1", accept_all(), cancel_a.cancelled()).await.unwrap();
        assert_eq!(a.id, "a");

        // b is gated: a is running.
        let info = queue.info();
        assert!(info.pending.is_empty());
        assert_eq!(info.waiting_on_deps.len(), 1);

        let cancel_b = CancelToken::new();
        let poll_b = queue.poll("agent-2", accept_all(), cancel_b.cancelled());

        queue.done("a");

        let b = poll_b.await.unwrap();
        assert_eq!(b.id, "b");
        assert_eq!(b.dep_status.get("a"), Some(&TaskOutcome::Success));
    }

    #[tokio::test]
    async fn lease_expiry_resubmits_to_front() {
        let config = QueueConfig::from_toml_str("extension_secs = 0").unwrap();
        let queue: Queue<()> = Queue::new(config);
        queue.push(Task::new("a", ()));

        let cancel = CancelToken::new();
        let first = queue.poll("agent-1", accept_all(), cancel.cancelled()).await.unwrap();
        assert_eq!(first.id, "a");

        // extension_secs = 0 means the lease is already expired; pushing
        // anything triggers a dispatch pass that resubmits it.
        queue.push(Task::new("z", ()));
        let info = queue.info();
        assert_eq!(info.pending.first().map(|t| t.id.as_str()), Some("a"));
    }

    #[tokio::test]
    async fn kick_unblocks_poll() {
        let queue: Queue<()> = Queue::default();
        let cancel = CancelToken::new();
        let poll = queue.poll("agent-7", accept_all(), cancel.cancelled());

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.kick_agent_workers("agent-7");

        let result = poll.await;
        assert!(matches!(result, Err(PollError::Kicked(KickReason::AgentKicked))));
        assert_eq!(queue.info().worker_count, 0);
    }

    #[tokio::test]
    async fn evict_pending_skips_it_on_poll() {
        let queue: Queue<()> = Queue::default();
        queue.push(Task::new("a", ()));
        queue.push(Task::new("b", ()));

        queue.evict("a").unwrap();

        let cancel = CancelToken::new();
        let task = queue.poll("agent-1", accept_all(), cancel.cancelled()).await.unwrap();
        assert_eq!(task.id, "b");
    }

    #[tokio::test]
    async fn evict_unknown_id_is_not_found() {
        let queue: Queue<()> = Queue::default();
        let err = queue.evict("missing").unwrap_err();
        assert_eq!(err, DispatchError::NotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn error_propagates_failure_to_waiter_info_without_the_message() {
        let queue: Queue<()> = Queue::default();
        queue.push(Task::new("a", ()));
        queue.push(Task::new("b", ()).with_dependencies(["a"]));

        let cancel = CancelToken::new();
        queue.poll("agent-1", accept_all(), cancel.cancelled()).await.unwrap();
        queue.error("a", "boom");

        let info = queue.info();
        let b = info
            .waiting_on_deps
            .iter()
            .chain(info.pending.iter())
            .find(|t| t.id == "b")
            .expect("b should still be queued");
        assert_eq!(b.dep_status.get("a"), Some(&TaskOutcome::Failure(String::new())));
    }

    #[tokio::test]
    async fn wait_returns_none_for_unknown_id() {
        let queue: Queue<()> = Queue::default();
        let cancel = CancelToken::new();
        let result = queue.wait("ghost", cancel.cancelled()).await;
        assert_eq!(result, Ok(None));
    }

    #[tokio::test]
    async fn wait_observes_done_outcome() {
        let queue: Queue<()> = Queue::default();
        queue.push(Task::new("a", ()));
        let cancel_poll = CancelToken::new();
        queue.poll("agent-1", accept_all(), cancel_poll.cancelled()).await.unwrap();

        let cancel_wait = CancelToken::new();
        let waiter = queue.wait("a", cancel_wait.cancelled());
        queue.done("a");
        assert_eq!(waiter.await, Ok(Some(TaskOutcome::Success)));
    }

    #[tokio::test]
    async fn double_done_is_a_no_op() {
        let queue: Queue<()> = Queue::default();
        queue.push(Task::new("a", ()));
        let cancel = CancelToken::new();
        queue.poll("agent-1", accept_all(), cancel.cancelled()).await.unwrap();

        queue.done("a");
        queue.done("a"); // must not panic or duplicate a running entry
        assert!(queue.info().running.is_empty());
    }

    #[tokio::test]
    async fn pause_then_resume_leaves_contents_unchanged() {
        let queue: Queue<()> = Queue::default();
        queue.push(Task::new("a", ()));
        queue.pause();
        queue.resume();
        assert_eq!(queue.info().pending.len(), 1);
    }

    #[tokio::test]
    async fn paused_queue_still_expires_leases_but_does_not_match() {
        let config = QueueConfig::from_toml_str("extension_secs = 0").unwrap();
        let queue: Queue<()> = Queue::new(config);
        queue.push(Task::new("a", ()));
        let cancel = CancelToken::new();
        queue.poll("agent-1", accept_all(), cancel.cancelled()).await.unwrap();

        queue.pause();
        // Force a pass: pause() itself does not dispatch, so register and
        // immediately cancel a poll instead, which still runs one.
        let poll_cancel = CancelToken::new();
        poll_cancel.cancel();
        let _ = queue.poll("agent-2", accept_all(), poll_cancel.cancelled()).await;

        let info = queue.info();
        assert!(info.running.is_empty(), "expired lease should still clear");
        assert_eq!(info.pending.len(), 1, "but should not be re-matched while paused");
    }
}
