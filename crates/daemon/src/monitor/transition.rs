//! State transition detection.
//!
//! Devices are polled, so the same state is usually reported many times in a
//! row and sometimes skipped entirely. [`TransitionDetector`] turns that feed
//! into discrete lifecycle events:
//!
//! - the first sample is a baseline and produces nothing
//! - a repeated state produces nothing
//! - a state change produces a [`StateTransition`] and at most one lifecycle
//!   event
//!
//! A job cycle opens with `Started` and closes with exactly one of
//! `Completed`, `Cancelled` or `Error`. A job already running when the
//! baseline was taken has no `Started`, but still gets its terminal event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use protocol::{
    now_millis, LifecycleEvent, LifecycleKind, PrinterState, RawStatus, SessionId,
    StateTransition, StatusSample,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{MonitorEvent, ServiceHandle, EVENT_CHANNEL_CAPACITY};

/// Job cycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cycle {
    Closed,
    /// A busy state was entered before the device reported a job.
    Pending,
    Open { job: String },
}

/// What one sample produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub transition: Option<StateTransition>,
    pub lifecycle: Option<LifecycleEvent>,
}

/// Pure state transition detector for one session.
#[derive(Debug)]
pub struct TransitionDetector {
    session_id: SessionId,
    last_state: Option<PrinterState>,
    last_job: Option<String>,
    cycle: Cycle,
}

impl TransitionDetector {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            last_state: None,
            last_job: None,
            cycle: Cycle::Closed,
        }
    }

    pub fn last_state(&self) -> Option<&PrinterState> {
        self.last_state.as_ref()
    }

    pub fn last_job(&self) -> Option<&str> {
        self.last_job.as_deref()
    }

    /// Returns the job of the open cycle, if any.
    pub fn open_job(&self) -> Option<&str> {
        match &self.cycle {
            Cycle::Open { job } => Some(job),
            _ => None,
        }
    }

    /// Feeds one validated sample.
    pub fn observe(&mut self, sample: &StatusSample) -> Detection {
        let Some(previous) = self.last_state.replace(sample.state.clone()) else {
            self.last_job = sample.job.clone();
            return Detection::default();
        };
        if sample.job.is_some() {
            self.last_job = sample.job.clone();
        }

        if previous == sample.state {
            return Detection {
                transition: None,
                lifecycle: self.deferred_start(sample),
            };
        }

        let timestamp = now_millis();
        let transition = StateTransition {
            session_id: self.session_id.clone(),
            from: previous.clone(),
            to: sample.state.clone(),
            timestamp,
        };

        let lifecycle = if sample.state.is_busy() && !previous.is_busy() {
            self.start(sample)
        } else if sample.state.is_busy() {
            self.deferred_start(sample)
        } else {
            let was_busy = previous.is_busy();
            match sample.state {
                PrinterState::Completed => self.finish(LifecycleKind::Completed, was_busy, sample),
                PrinterState::Cancelled => self.finish(LifecycleKind::Cancelled, was_busy, sample),
                PrinterState::Error => self.finish(LifecycleKind::Error, was_busy, sample),
                _ => None,
            }
        };

        Detection {
            transition: Some(transition),
            lifecycle,
        }
    }

    fn start(&mut self, sample: &StatusSample) -> Option<LifecycleEvent> {
        if matches!(self.cycle, Cycle::Open { .. }) {
            return None;
        }
        match &sample.job {
            Some(job) => {
                self.cycle = Cycle::Open { job: job.clone() };
                Some(self.event(LifecycleKind::Started, Some(job.clone()), sample))
            }
            None => {
                self.cycle = Cycle::Pending;
                None
            }
        }
    }

    fn deferred_start(&mut self, sample: &StatusSample) -> Option<LifecycleEvent> {
        if self.cycle == Cycle::Pending && sample.state.is_busy() {
            return self.start(sample);
        }
        None
    }

    /// Closes the current cycle.
    ///
    /// A job already running when monitoring began (attach or reconnect
    /// mid-print) has no open cycle, but still ends with a terminal event
    /// when the device leaves the busy set.
    fn finish(
        &mut self,
        kind: LifecycleKind,
        was_busy: bool,
        sample: &StatusSample,
    ) -> Option<LifecycleEvent> {
        let job = match std::mem::replace(&mut self.cycle, Cycle::Closed) {
            Cycle::Open { job } => Some(sample.job.clone().unwrap_or(job)),
            Cycle::Pending if was_busy => sample.job.clone(),
            Cycle::Closed if was_busy => sample.job.clone().or_else(|| self.last_job.clone()),
            Cycle::Pending | Cycle::Closed => return None,
        };
        Some(self.event(kind, job, sample))
    }

    fn event(&self, kind: LifecycleKind, job: Option<String>, sample: &StatusSample) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            session_id: self.session_id.clone(),
            job,
            status: sample.clone(),
            timestamp: now_millis(),
        }
    }
}

/// Async wrapper around [`TransitionDetector`] for one session.
///
/// Create it, subscribe every dependent, then [`start`](Self::start) it so
/// no dependent misses the first events.
pub struct StateTransitionMonitor {
    session_id: SessionId,
    events: broadcast::Sender<MonitorEvent>,
    latest: Arc<watch::Sender<Option<StatusSample>>>,
    service: ServiceHandle,
}

impl StateTransitionMonitor {
    pub fn new(session_id: SessionId, cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (latest, _) = watch::channel(None);
        Self {
            session_id,
            events,
            latest: Arc::new(latest),
            service: ServiceHandle::new("state transition monitor", cancel),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Latest validated sample.
    pub fn latest(&self) -> watch::Receiver<Option<StatusSample>> {
        self.latest.subscribe()
    }

    /// Starts consuming `feed`.
    ///
    /// `last_activity` is stamped with every valid sample.
    pub fn start(
        &mut self,
        mut feed: mpsc::Receiver<RawStatus>,
        last_activity: Arc<AtomicU64>,
    ) {
        let cancel = self.service.token();
        let session_id = self.session_id.clone();
        let events = self.events.clone();
        let latest = Arc::clone(&self.latest);

        let handle = tokio::spawn(async move {
            let mut detector = TransitionDetector::new(session_id.clone());
            tracing::debug!(session_id = %session_id, "State transition monitor started");

            loop {
                let raw = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    raw = feed.recv() => match raw {
                        Some(raw) => raw,
                        None => break,
                    },
                };

                let sample = match raw.validate() {
                    Ok(sample) => sample,
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, "Dropping status sample: {}", e);
                        continue;
                    }
                };
                if cancel.is_cancelled() {
                    break;
                }

                last_activity.store(sample.received_at, Ordering::Relaxed);
                let detection = detector.observe(&sample);
                latest.send_replace(Some(sample.clone()));
                let _ = events.send(MonitorEvent::Sample(sample));

                if let Some(transition) = detection.transition {
                    tracing::debug!(
                        session_id = %session_id,
                        from = %transition.from,
                        to = %transition.to,
                        "State transition"
                    );
                    let _ = events.send(MonitorEvent::Transition(transition));
                }
                if let Some(event) = detection.lifecycle {
                    tracing::info!(
                        session_id = %session_id,
                        kind = ?event.kind,
                        job = event.job.as_deref().unwrap_or("-"),
                        "Job lifecycle event"
                    );
                    let _ = events.send(MonitorEvent::Lifecycle(event));
                }
            }

            tracing::debug!(session_id = %session_id, "State transition monitor stopped");
        });
        self.service.attach(handle);
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    pub async fn stop(self) -> Result<(), super::TeardownError> {
        self.service.stop().await
    }
}
