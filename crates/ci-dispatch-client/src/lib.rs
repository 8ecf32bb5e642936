//! A retrying wrapper around [`ci_dispatch_core::Queue`].
//!
//! An exponential-backoff retry loop around the core's own `poll`, so
//! callers written against a real RPC transport (where a worker's
//! registration can be dropped by a load balancer, a proxy timeout,
//! anything) see the same retry policy whether or not a network hop is
//! actually present. `wait`/`extend`/`evict` are passed straight through:
//! none of their failure modes are transient in a single-process deployment.

use std::future::Future;
use std::time::Duration;

use ci_dispatch_core::{DispatchError, Filter, PollError, Queue, Task, TaskOutcome};
use tracing::{debug, warn};

/// Initial backoff before the first retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
/// Backoff ceiling; doubles each attempt until it hits this.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Wraps a [`Queue`] and retries `poll` when a worker is kicked rather than
/// surfacing the kick to the caller.
pub struct RetryingClient<P> {
    queue: Queue<P>,
    max_attempts: u32,
}

impl<P> Clone for RetryingClient<P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

/// Returned by [`RetryingClient::poll`] once retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ClientPollError {
    /// The caller's cancellation future resolved; not retried.
    #[error("poll cancelled")]
    Cancelled,
    /// The worker was kicked on every attempt up to `max_attempts`.
    #[error("poll kicked {attempts} time(s) in a row, giving up")]
    KickedRepeatedly { attempts: u32 },
}

impl<P> RetryingClient<P> {
    /// Wrap `queue`, retrying a kicked `poll` up to `max_attempts` times
    /// (an attempt count of 1 disables retrying).
    pub fn new(queue: Queue<P>, max_attempts: u32) -> Self {
        Self { queue, max_attempts: max_attempts.max(1) }
    }

    /// Poll for a task, automatically re-registering on `PollError::Kicked`
    /// with exponential backoff between attempts. A caller-cancelled poll is
    /// never retried; the same `cancel` future is honored across every
    /// attempt.
    pub async fn poll(
        &self,
        agent_id: impl Into<String> + Clone,
        filter_factory: impl Fn() -> Filter<P>,
        cancel: impl Future<Output = ()>,
    ) -> Result<Task<P>, ClientPollError>
    where
        P: Clone + Send + 'static,
    {
        tokio::pin!(cancel);
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=self.max_attempts {
            match self.queue.poll(agent_id.clone(), filter_factory(), &mut cancel).await {
                Ok(task) => return Ok(task),
                Err(PollError::Cancelled) => return Err(ClientPollError::Cancelled),
                Err(PollError::Kicked(reason)) => {
                    warn!(attempt, ?reason, "poll kicked, retrying");
                    if attempt == self.max_attempts {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        Err(ClientPollError::KickedRepeatedly { attempts: self.max_attempts })
    }

    /// Wait for a task to finish. Passed straight through: `Cancelled` is
    /// caller-initiated, never transient.
    pub async fn wait(
        &self,
        id: impl AsRef<str>,
        cancel: impl Future<Output = ()>,
    ) -> Result<Option<TaskOutcome>, ci_dispatch_core::Cancelled> {
        self.queue.wait(id, cancel).await
    }

    /// Renew a lease. Passed straight through: `NotFound` means the id will
    /// never exist, never transient.
    pub fn extend(&self, id: impl AsRef<str>) -> Result<(), DispatchError> {
        self.queue.extend(id)
    }

    /// Evict a pending task. Passed straight through: `NotFound` means the
    /// id will never exist, never transient.
    pub fn evict(&self, id: impl AsRef<str>) -> Result<(), DispatchError> {
        self.queue.evict(id)
    }

    /// Push a task. Never fails, nothing to retry.
    pub fn push(&self, task: Task<P>)
    where
        P: Clone,
    {
        debug!(task_id = %task.id, "client push");
        self.queue.push(task);
    }

    /// The wrapped queue, for callers that need direct access (e.g. `info`,
    /// `pause`/`resume`, `kick_agent_workers`).
    pub fn queue(&self) -> &Queue<P> {
        &self.queue
    }
}
