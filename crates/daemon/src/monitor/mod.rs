//! Per-session services derived from the device status feed.
//!
//! The [`transition`] monitor is the single producer: it validates raw
//! samples and publishes samples, state transitions and lifecycle events on
//! one broadcast channel, so every dependent sees them in the same order.
//!
//! - [`transition`]: State transition detection
//! - [`cooldown`]: Post-print bed cooldown watch
//! - [`usage`]: Filament usage deduction
//! - [`notify`]: Notification decisions

pub mod cooldown;
pub mod notify;
pub mod transition;
pub mod usage;

use protocol::{LifecycleEvent, StateTransition, StatusSample};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use cooldown::CooldownMonitor;
pub use notify::{
    BroadcastSink, NotificationDispatcher, NotificationFlags, NotificationSink, TracingSink,
};
pub use transition::{Detection, StateTransitionMonitor, TransitionDetector};
pub use usage::{
    DeductionOutcome, HttpUsageLedger, LoggingLedger, MemoryLedger, UsageError, UsageLedger,
    UsageService, UsageTracker,
};

/// Capacity of per-session event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the state transition monitor publishes, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A validated sample. Always precedes events derived from it.
    Sample(StatusSample),
    Transition(StateTransition),
    Lifecycle(LifecycleEvent),
}

/// A service task failed to shut down cleanly.
#[derive(Debug, Error)]
#[error("{service} did not stop cleanly: {reason}")]
pub struct TeardownError {
    pub service: &'static str,
    pub reason: String,
}

/// A spawned per-session task and its cancellation token.
pub struct ServiceHandle {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    pub(crate) fn new(name: &'static str, cancel: CancellationToken) -> Self {
        Self {
            name,
            cancel,
            handle: None,
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn attach(&mut self, handle: JoinHandle<()>) {
        self.handle = Some(handle);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels the task and waits for it to exit.
    pub async fn stop(mut self) -> Result<(), TeardownError> {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.await.map_err(|e| TeardownError {
            service: self.name,
            reason: e.to_string(),
        })
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Receives the next event, skipping over lag.
///
/// Returns `None` when the channel is closed.
pub(crate) async fn recv_event<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    service: &'static str,
) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(service, skipped = n, "Event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
