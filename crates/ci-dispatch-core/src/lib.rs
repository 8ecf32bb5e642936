//! In-memory task dispatch core: matchmaking between pending tasks and
//! polling workers, dependency gating, lease management, and administrative
//! pause/evict/kick.
//!
//! The queue never touches disk or the network; it is the scheduling
//! primitive a CI control plane builds its externally-facing pieces around.
//! See [`Queue`] for the public API.

mod cancel;
mod config;
mod entry;
mod error;
mod queue;
mod task;
mod worker;

pub use cancel::{CancelToken, KickReason, KickSignal, Signal};
pub use config::QueueConfig;
pub use error::{Cancelled, ConfigError, DispatchError};
pub use queue::{PollError, Queue, QueueInfo};
pub use task::{Task, TaskId, TaskOutcome};
pub use worker::Filter;
