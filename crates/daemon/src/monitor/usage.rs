//! Filament usage deduction.
//!
//! Devices reset their usage counters once a job finishes, so the tracker
//! remembers the last positive reading seen while printing and deducts that
//! figure when the job completes. Each job is deducted at most once; a
//! failed deduction is logged and not retried.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::{LifecycleEvent, LifecycleKind, SessionId, StatusSample};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{recv_event, MonitorEvent, ServiceHandle, TeardownError};

/// Errors returned by usage ledgers.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("deduction request failed: {0}")]
    Request(String),

    #[error("deduction rejected with status {0}")]
    Rejected(u16),
}

/// External store that filament usage is deducted from.
pub trait UsageLedger: Send + Sync {
    fn deduct<'a>(&'a self, job_id: &'a str, amount_g: f64) -> BoxFuture<'a, Result<(), UsageError>>;
}

#[derive(Serialize)]
struct DeductionRequest<'a> {
    job_id: &'a str,
    amount_g: f64,
}

/// POSTs deductions as JSON to a fixed endpoint.
pub struct HttpUsageLedger {
    client: reqwest::Client,
    url: String,
}

impl HttpUsageLedger {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, UsageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UsageError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl UsageLedger for HttpUsageLedger {
    fn deduct<'a>(&'a self, job_id: &'a str, amount_g: f64) -> BoxFuture<'a, Result<(), UsageError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(&DeductionRequest { job_id, amount_g })
                .send()
                .await
                .map_err(|e| UsageError::Request(e.to_string()))?;

            if !response.status().is_success() {
                return Err(UsageError::Rejected(response.status().as_u16()));
            }
            Ok(())
        })
    }
}

/// Logs deductions without sending them anywhere.
pub struct LoggingLedger;

impl UsageLedger for LoggingLedger {
    fn deduct<'a>(&'a self, job_id: &'a str, amount_g: f64) -> BoxFuture<'a, Result<(), UsageError>> {
        Box::pin(async move {
            tracing::info!(job_id, amount_g, "Filament usage (no deduction endpoint configured)");
            Ok(())
        })
    }
}

/// Records deductions in memory.
#[derive(Default)]
pub struct MemoryLedger {
    calls: StdMutex<Vec<(String, f64)>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every deduction made so far, in order.
    pub fn calls(&self) -> Vec<(String, f64)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl UsageLedger for MemoryLedger {
    fn deduct<'a>(&'a self, job_id: &'a str, amount_g: f64) -> BoxFuture<'a, Result<(), UsageError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((job_id.to_string(), amount_g));
            Ok(())
        })
    }
}

/// Result of handling a completion.
#[derive(Debug, Clone, PartialEq)]
pub enum DeductionOutcome {
    /// The ledger should be charged.
    Deduct { job: String, amount_g: f64 },
    /// The job was already recorded.
    Duplicate { job: String },
    /// No positive usage was observed for the job.
    NothingToDeduct { job: Option<String> },
}

/// Pure usage bookkeeping for one session.
#[derive(Debug, Default)]
pub struct UsageTracker {
    cached_g: Option<f64>,
    recorded_job: Option<String>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_usage(&self) -> Option<f64> {
        self.cached_g
    }

    /// Caches the usage of samples taken while printing.
    pub fn observe_sample(&mut self, sample: &StatusSample) {
        if !sample.state.reports_usage() {
            return;
        }
        if let Some(g) = sample.filament_used_g.filter(|g| *g > 0.0) {
            self.cached_g = Some(g);
        }
    }

    /// Handles a lifecycle event. Returns an outcome for completions only.
    pub fn on_lifecycle(&mut self, event: &LifecycleEvent) -> Option<DeductionOutcome> {
        match event.kind {
            LifecycleKind::Started => {
                self.cached_g = None;
                self.recorded_job = None;
                // The sample that opened the job may already carry usage.
                self.observe_sample(&event.status);
                None
            }
            LifecycleKind::Completed => Some(self.on_completed(event.job.as_deref())),
            LifecycleKind::Cancelled | LifecycleKind::Error => None,
        }
    }

    fn on_completed(&mut self, job: Option<&str>) -> DeductionOutcome {
        let Some(job) = job else {
            return DeductionOutcome::NothingToDeduct { job: None };
        };
        if self.recorded_job.as_deref() == Some(job) {
            return DeductionOutcome::Duplicate {
                job: job.to_string(),
            };
        }
        match self.cached_g {
            Some(amount_g) => {
                self.recorded_job = Some(job.to_string());
                DeductionOutcome::Deduct {
                    job: job.to_string(),
                    amount_g,
                }
            }
            None => DeductionOutcome::NothingToDeduct {
                job: Some(job.to_string()),
            },
        }
    }
}

/// Runs a [`UsageTracker`] against the session's monitor events.
pub struct UsageService {
    session_id: SessionId,
    ledger: Arc<dyn UsageLedger>,
    service: ServiceHandle,
}

impl UsageService {
    pub fn new(session_id: SessionId, ledger: Arc<dyn UsageLedger>, cancel: CancellationToken) -> Self {
        Self {
            session_id,
            ledger,
            service: ServiceHandle::new("usage tracker", cancel),
        }
    }

    pub fn start(&mut self, mut events: broadcast::Receiver<MonitorEvent>) {
        let cancel = self.service.token();
        let session_id = self.session_id.clone();
        let ledger = Arc::clone(&self.ledger);

        let handle = tokio::spawn(async move {
            let mut tracker = UsageTracker::new();

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = recv_event(&mut events, "usage tracker") => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let outcome = match &event {
                    MonitorEvent::Sample(sample) => {
                        tracker.observe_sample(sample);
                        None
                    }
                    MonitorEvent::Lifecycle(event) => tracker.on_lifecycle(event),
                    MonitorEvent::Transition(_) => None,
                };

                match outcome {
                    Some(DeductionOutcome::Deduct { job, amount_g }) => {
                        let result = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                tracing::warn!(session_id = %session_id, job = %job, "Deduction abandoned on shutdown");
                                break;
                            }
                            result = ledger.deduct(&job, amount_g) => result,
                        };
                        match result {
                            Ok(()) => {
                                tracing::info!(session_id = %session_id, job = %job, amount_g, "Deducted filament usage")
                            }
                            Err(e) => tracing::error!(
                                session_id = %session_id,
                                job = %job,
                                amount_g,
                                "Filament deduction failed, not retrying: {}",
                                e
                            ),
                        }
                    }
                    Some(DeductionOutcome::Duplicate { job }) => {
                        tracing::debug!(session_id = %session_id, job = %job, "Usage already recorded for job");
                    }
                    Some(DeductionOutcome::NothingToDeduct { job }) => {
                        tracing::info!(
                            session_id = %session_id,
                            job = job.as_deref().unwrap_or("-"),
                            "No filament usage observed for job"
                        );
                    }
                    None => {}
                }
            }

            tracing::debug!(session_id = %session_id, "Usage tracker stopped");
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

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{now_millis, RawStatus};
    use tokio::time::timeout;

    fn sample(state: &str, used: f64) -> StatusSample {
        RawStatus::new(state)
            .with_job("x.gcode")
            .with_filament_used(used)
            .validate()
            .unwrap()
    }

    fn event(kind: LifecycleKind, job: &str, status: StatusSample) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            session_id: "s1".to_string(),
            job: Some(job.to_string()),
            status,
            timestamp: now_millis(),
        }
    }

    #[test]
    fn test_deducts_cached_not_zeroed_usage() {
        let mut tracker = UsageTracker::new();
        tracker.observe_sample(&sample("printing", 4.0));
        tracker.observe_sample(&sample("printing", 10.0));
        let done = sample("completed", 0.0);
        tracker.observe_sample(&done);

        assert_eq!(
            tracker.on_lifecycle(&event(LifecycleKind::Completed, "x.gcode", done.clone())),
            Some(DeductionOutcome::Deduct {
                job: "x.gcode".to_string(),
                amount_g: 10.0
            })
        );
        assert_eq!(
            tracker.on_lifecycle(&event(LifecycleKind::Completed, "x.gcode", done)),
            Some(DeductionOutcome::Duplicate {
                job: "x.gcode".to_string()
            })
        );
    }

    #[test]
    fn test_paused_usage_is_cached_idle_is_not() {
        let mut tracker = UsageTracker::new();
        tracker.observe_sample(&sample("paused", 3.5));
        assert_eq!(tracker.cached_usage(), Some(3.5));
        tracker.observe_sample(&sample("idle", 99.0));
        tracker.observe_sample(&sample("printing", 0.0));
        assert_eq!(tracker.cached_usage(), Some(3.5));
    }

    #[test]
    fn test_started_resets() {
        let mut tracker = UsageTracker::new();
        tracker.observe_sample(&sample("printing", 7.0));
        let done = sample("completed", 0.0);
        tracker.on_lifecycle(&event(LifecycleKind::Completed, "x.gcode", done.clone()));

        tracker.on_lifecycle(&event(LifecycleKind::Started, "x.gcode", sample("printing", 0.0)));
        assert_eq!(tracker.cached_usage(), None);
        assert_eq!(
            tracker.on_lifecycle(&event(LifecycleKind::Completed, "x.gcode", done)),
            Some(DeductionOutcome::NothingToDeduct {
                job: Some("x.gcode".to_string())
            })
        );
    }

    #[test]
    fn test_usage_on_opening_sample_survives_started() {
        let mut tracker = UsageTracker::new();
        let printing = sample("printing", 10.0);
        tracker.observe_sample(&printing);
        tracker.on_lifecycle(&event(LifecycleKind::Started, "x.gcode", printing));
        assert_eq!(tracker.cached_usage(), Some(10.0));

        let done = sample("completed", 0.0);
        tracker.observe_sample(&done);
        assert_eq!(
            tracker.on_lifecycle(&event(LifecycleKind::Completed, "x.gcode", done)),
            Some(DeductionOutcome::Deduct {
                job: "x.gcode".to_string(),
                amount_g: 10.0
            })
        );
    }

    #[test]
    fn test_nothing_cached() {
        let mut tracker = UsageTracker::new();
        let outcome =
            tracker.on_lifecycle(&event(LifecycleKind::Completed, "y.gcode", sample("completed", 0.0)));
        assert!(matches!(
            outcome,
            Some(DeductionOutcome::NothingToDeduct { .. })
        ));
    }

    #[tokio::test]
    async fn test_service_deducts_once() {
        let ledger = Arc::new(MemoryLedger::new());
        let (tx, rx) = broadcast::channel(16);
        let mut service = UsageService::new("s1".to_string(), ledger.clone(), CancellationToken::new());
        service.start(rx);

        let printing = sample("printing", 10.0);
        let done = sample("completed", 0.0);
        tx.send(MonitorEvent::Sample(printing)).unwrap();
        tx.send(MonitorEvent::Sample(done.clone())).unwrap();
        tx.send(MonitorEvent::Lifecycle(event(LifecycleKind::Completed, "x.gcode", done.clone())))
            .unwrap();
        tx.send(MonitorEvent::Lifecycle(event(LifecycleKind::Completed, "x.gcode", done)))
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while ledger.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no deduction");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ledger.calls(), vec![("x.gcode".to_string(), 10.0)]);
        service.stop().await.unwrap();
    }

    struct StalledLedger;

    impl UsageLedger for StalledLedger {
        fn deduct<'a>(&'a self, _job_id: &'a str, _amount_g: f64) -> BoxFuture<'a, Result<(), UsageError>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_stalled_ledger() {
        let (tx, rx) = broadcast::channel(16);
        let mut service = UsageService::new("s1".to_string(), Arc::new(StalledLedger), CancellationToken::new());
        service.start(rx);

        let printing = sample("printing", 10.0);
        let done = sample("completed", 0.0);
        tx.send(MonitorEvent::Sample(printing)).unwrap();
        tx.send(MonitorEvent::Lifecycle(event(LifecycleKind::Completed, "x.gcode", done)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(Duration::from_secs(1), service.stop())
            .await
            .expect("stop blocked on the ledger")
            .unwrap();
    }
}
