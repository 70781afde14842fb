//! Post-print cooldown watch.
//!
//! After a job completes the bed is checked right away and then on every
//! poll interval until it reads below the threshold. A new cycle, a
//! cancellation or an error abandons the watch.

use std::time::Duration;

use protocol::{now_millis, CooledEvent, LifecycleKind, SessionId, StatusSample};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{recv_event, MonitorEvent, ServiceHandle, TeardownError, EVENT_CHANNEL_CAPACITY};
use crate::config::CooldownConfig;

/// An in-progress watch for one completed job.
struct Watch {
    job: Option<String>,
    started: Instant,
    ticker: Interval,
}

/// Watches the bed temperature after each completed job.
pub struct CooldownMonitor {
    session_id: SessionId,
    config: CooldownConfig,
    cooled: broadcast::Sender<CooledEvent>,
    service: ServiceHandle,
}

impl CooldownMonitor {
    pub fn new(session_id: SessionId, config: CooldownConfig, cancel: CancellationToken) -> Self {
        let (cooled, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session_id,
            config,
            cooled,
            service: ServiceHandle::new("cooldown monitor", cancel),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CooledEvent> {
        self.cooled.subscribe()
    }

    /// Starts reacting to lifecycle events.
    ///
    /// Temperatures are read from `latest`, which the transition monitor
    /// updates before publishing the event derived from a sample.
    pub fn start(
        &mut self,
        mut events: broadcast::Receiver<MonitorEvent>,
        latest: watch::Receiver<Option<StatusSample>>,
    ) {
        let cancel = self.service.token();
        let session_id = self.session_id.clone();
        let config = self.config.clone();
        let cooled = self.cooled.clone();

        let handle = tokio::spawn(async move {
            let mut current: Option<Watch> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = recv_event(&mut events, "cooldown monitor") => {
                        let Some(event) = event else { break };
                        let MonitorEvent::Lifecycle(event) = event else { continue };
                        match event.kind {
                            LifecycleKind::Completed => {
                                tracing::debug!(session_id = %session_id, "Watching bed cooldown");
                                current = Some(Watch {
                                    job: event.job,
                                    started: Instant::now(),
                                    ticker: ticker(config.poll_interval()),
                                });
                            }
                            LifecycleKind::Started | LifecycleKind::Cancelled | LifecycleKind::Error => {
                                if current.take().is_some() {
                                    tracing::debug!(session_id = %session_id, "Cooldown watch reset");
                                }
                            }
                        }
                    }
                    _ = next_tick(&mut current) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let done = match current.as_ref() {
                            Some(w) => check(&session_id, &config, w, &latest, &cooled),
                            None => false,
                        };
                        if done {
                            current = None;
                        }
                    }
                }
            }

            tracing::debug!(session_id = %session_id, "Cooldown monitor stopped");
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

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(current: &mut Option<Watch>) {
    match current {
        Some(active) => {
            active.ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Runs one temperature check. Returns true when the watch is over.
fn check(
    session_id: &str,
    config: &CooldownConfig,
    active: &Watch,
    latest: &watch::Receiver<Option<StatusSample>>,
    cooled: &broadcast::Sender<CooledEvent>,
) -> bool {
    let temperature = latest.borrow().as_ref().and_then(|s| s.bed_temp);

    match temperature {
        Some(temp) if temp < config.threshold_c => {
            tracing::info!(
                session_id = %session_id,
                temperature = temp,
                threshold = config.threshold_c,
                "Bed cooled"
            );
            let _ = cooled.send(CooledEvent {
                session_id: session_id.to_string(),
                job: active.job.clone(),
                temperature: temp,
                threshold: config.threshold_c,
                timestamp: now_millis(),
            });
            return true;
        }
        Some(temp) => {
            tracing::trace!(session_id = %session_id, temperature = temp, "Bed still warm");
        }
        None => {
            tracing::debug!(session_id = %session_id, "No bed temperature reading");
        }
    }

    if let Some(max_wait) = config.max_wait() {
        if active.started.elapsed() >= max_wait {
            tracing::warn!(
                session_id = %session_id,
                waited_secs = max_wait.as_secs(),
                "Bed did not cool in time, giving up"
            );
            return true;
        }
    }
    false
}
