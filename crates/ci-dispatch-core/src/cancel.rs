//! Reusable one-shot, reason-carrying signal.
//!
//! A small primitive reused for two purposes here: the administrative
//! "kick" of a blocked `poll`, and [`CancelToken`], a convenience
//! cancellation handle for callers who do not already have one.

use std::sync::Mutex;

use tokio::sync::Notify;

/// A signal that fires at most once, carrying a `reason` of type `R`.
///
/// Firing after the signal has already fired is a no-op; the first reason
/// wins. Any number of callers may await [`Signal::notified`] concurrently,
/// including after the signal has already fired: they observe the stored
/// reason immediately rather than hanging.
pub struct Signal<R> {
    notify: Notify,
    reason: Mutex<Option<R>>,
}

impl<R: Clone> Signal<R> {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            reason: Mutex::new(None),
        }
    }

    /// Fire the signal, if it has not already fired.
    pub fn fire(&self, reason: R) {
        let mut slot = self.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
            drop(slot);
            self.notify.notify_waiters();
        }
    }

    /// Resolve once [`Signal::fire`] has been called, returning its reason.
    ///
    /// Uses the standard "register interest, then check state" ordering so a
    /// `fire` that races a fresh call to `notified` is never missed.
    pub async fn notified(&self) -> R {
        loop {
            let notified = self.notify.notified();
            if let Some(reason) = self.reason.lock().unwrap().clone() {
                return reason;
            }
            notified.await;
        }
    }

    pub fn is_fired(&self) -> bool {
        self.reason.lock().unwrap().is_some()
    }
}

impl<R: Clone> Default for Signal<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a blocked `poll` was terminated by the administrative path rather
/// than by caller cancellation or a normal match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickReason {
    /// `Queue::kick_agent_workers` removed this worker from the registry.
    AgentKicked,
}

/// Per-worker kick handle. Only `Queue::kick_agent_workers` ever fires one.
pub type KickSignal = Signal<KickReason>;

/// A plain cancellation handle for callers of `poll`/`wait` that do not
/// already have a future to race (e.g. a request deadline or a shutdown
/// broadcast). Any `Future<Output = ()>` works equally well in those APIs;
/// this type is provided purely for convenience.
pub type CancelToken = Signal<()>;

impl CancelToken {
    pub fn cancel(&self) {
        self.fire(());
    }

    pub async fn cancelled(&self) {
        self.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_before_await_is_observed_immediately() {
        let signal: KickSignal = Signal::new();
        signal.fire(KickReason::AgentKicked);
        assert_eq!(signal.notified().await, KickReason::AgentKicked);
    }

    #[tokio::test]
    async fn second_fire_does_not_override_reason() {
        let signal: Signal<u32> = Signal::new();
        signal.fire(1);
        signal.fire(2);
        assert_eq!(signal.notified().await, 1);
    }

    #[tokio::test]
    async fn notified_wakes_up_once_fired_later() {
        let signal = Arc::new(CancelToken::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move {
                signal.cancelled().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();
        waiter.await.unwrap();
        assert!(signal.is_fired());
    }
}
