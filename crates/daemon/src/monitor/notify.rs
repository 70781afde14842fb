//! Notification decisions.
//!
//! The dispatcher decides *whether* to notify; sinks decide how. Each job
//! notifies at most once for completion and once for cooldown.

use std::sync::Arc;

use protocol::{
    now_millis, CooledEvent, LifecycleKind, NotificationDecision, NotificationKind,
    NotificationSettings, SessionId,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::{recv_event, MonitorEvent, ServiceHandle, TeardownError};

/// Receives notification decisions.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, decision: &NotificationDecision);
}

/// Logs every decision.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, decision: &NotificationDecision) {
        tracing::info!(
            session_id = %decision.session_id,
            kind = ?decision.kind,
            job = decision.job.as_deref().unwrap_or("-"),
            "Notify"
        );
    }
}

/// Publishes decisions on a broadcast channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<NotificationDecision>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationDecision> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, decision: &NotificationDecision) {
        let _ = self.tx.send(decision.clone());
    }
}

/// Per-job "already notified" flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotificationFlags {
    pub print_complete_notified: bool,
    pub cooled_notified: bool,
}

impl NotificationFlags {
    /// Returns true if `kind` should be notified now, marking it notified.
    pub fn decide(&mut self, kind: NotificationKind, settings: &NotificationSettings) -> bool {
        if !settings.allows(kind) {
            return false;
        }
        let flag = match kind {
            NotificationKind::PrintComplete => &mut self.print_complete_notified,
            NotificationKind::Cooled => &mut self.cooled_notified,
        };
        if *flag {
            return false;
        }
        *flag = true;
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Turns lifecycle and cooled events into notification decisions.
pub struct NotificationDispatcher {
    session_id: SessionId,
    sinks: Vec<Arc<dyn NotificationSink>>,
    service: ServiceHandle,
}

impl NotificationDispatcher {
    pub fn new(
        session_id: SessionId,
        sinks: Vec<Arc<dyn NotificationSink>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            sinks,
            service: ServiceHandle::new("notification dispatcher", cancel),
        }
    }

    pub fn start(
        &mut self,
        mut events: broadcast::Receiver<MonitorEvent>,
        mut cooled: broadcast::Receiver<CooledEvent>,
        settings: watch::Receiver<NotificationSettings>,
    ) {
        let cancel = self.service.token();
        let session_id = self.session_id.clone();
        let sinks = self.sinks.clone();

        let handle = tokio::spawn(async move {
            let mut flags = NotificationFlags::default();
            let mut cooled_open = true;

            loop {
                let (kind, job) = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = recv_event(&mut events, "notification dispatcher") => {
                        let Some(event) = event else { break };
                        let MonitorEvent::Lifecycle(event) = event else { continue };
                        match event.kind {
                            LifecycleKind::Completed => (NotificationKind::PrintComplete, event.job),
                            LifecycleKind::Started | LifecycleKind::Cancelled | LifecycleKind::Error => {
                                flags.reset();
                                continue;
                            }
                        }
                    }
                    event = recv_event(&mut cooled, "notification dispatcher"), if cooled_open => {
                        match event {
                            Some(event) => (NotificationKind::Cooled, event.job),
                            None => {
                                cooled_open = false;
                                continue;
                            }
                        }
                    }
                };

                let current = *settings.borrow();
                if cancel.is_cancelled() || !flags.decide(kind, &current) {
                    continue;
                }

                let decision = NotificationDecision {
                    session_id: session_id.clone(),
                    kind,
                    job,
                    timestamp: now_millis(),
                };
                for sink in &sinks {
                    sink.notify(&decision);
                }
            }

            tracing::debug!(session_id = %session_id, "Notification dispatcher stopped");
        });
        self.service.attach(handle);
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    pub async fn stop(self) -> Result<(), TeardownError> {
        self.service.stop().await
    }
}
