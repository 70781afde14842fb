//! The dependent service chain of a connected session.
//!
//! Services are built together when the device connects and torn down
//! together when it disconnects or the session is removed:
//!
//! ```text
//! device feed -> StateTransitionMonitor -+-> CooldownMonitor --+
//!                                        +-> UsageService      +-> NotificationDispatcher
//!                                        +---------------------+
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use protocol::{CooledEvent, NotificationSettings, RawStatus, SessionEvent, SessionId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::CooldownConfig;
use crate::monitor::{
    recv_event, CooldownMonitor, MonitorEvent, NotificationDispatcher, NotificationSink,
    ServiceHandle, StateTransitionMonitor, UsageLedger, UsageService,
};

/// Shared inputs for building a session's services.
#[derive(Clone)]
pub struct ServiceContext {
    pub cooldown: CooldownConfig,
    pub ledger: Arc<dyn UsageLedger>,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
    pub settings: watch::Receiver<NotificationSettings>,
    /// Registry-wide feed of lifecycle and cooled events.
    pub session_events: broadcast::Sender<SessionEvent>,
}

/// Outcome of a best-effort teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Steps that ran, in order.
    pub steps: Vec<&'static str>,
    /// First failure, if any.
    pub first_error: Option<String>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_clean(&self) -> bool {
        self.first_error.is_none()
    }

    /// Records a step. Only the first error is kept.
    pub fn record<E: std::fmt::Display>(&mut self, step: &'static str, result: Result<(), E>) {
        self.steps.push(step);
        if let Err(e) = result {
            tracing::warn!(step, "Teardown step failed: {}", e);
            if self.first_error.is_none() {
                self.first_error = Some(format!("{}: {}", step, e));
            }
        }
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.steps.extend(other.steps);
        if self.first_error.is_none() {
            self.first_error = other.first_error;
        }
    }
}

/// The running services of one connected session.
pub struct SessionServices {
    session_id: SessionId,
    cancel: CancellationToken,
    monitor: StateTransitionMonitor,
    cooldown: CooldownMonitor,
    usage: UsageService,
    notify: NotificationDispatcher,
    forwarder: ServiceHandle,
}

impl SessionServices {
    /// Builds and starts the chain in dependency order.
    ///
    /// Every dependent subscribes before the monitor starts consuming
    /// `feed`, so none of them misses an event.
    pub fn build(
        session_id: &str,
        ctx: &ServiceContext,
        feed: mpsc::Receiver<RawStatus>,
        parent: &CancellationToken,
        last_activity: Arc<AtomicU64>,
    ) -> Self {
        let cancel = parent.child_token();
        let session_id = session_id.to_string();

        let mut monitor = StateTransitionMonitor::new(session_id.clone(), cancel.child_token());

        let mut cooldown =
            CooldownMonitor::new(session_id.clone(), ctx.cooldown.clone(), cancel.child_token());
        cooldown.start(monitor.subscribe(), monitor.latest());

        let mut usage =
            UsageService::new(session_id.clone(), Arc::clone(&ctx.ledger), cancel.child_token());
        usage.start(monitor.subscribe());

        let mut notify =
            NotificationDispatcher::new(session_id.clone(), ctx.sinks.clone(), cancel.child_token());
        notify.start(
            monitor.subscribe(),
            cooldown.subscribe(),
            ctx.settings.clone(),
        );

        let forwarder = spawn_forwarder(
            monitor.subscribe(),
            cooldown.subscribe(),
            ctx.session_events.clone(),
            cancel.child_token(),
        );

        monitor.start(feed, last_activity);
        tracing::info!(session_id = %session_id, "Session services started");

        Self {
            session_id,
            cancel,
            monitor,
            cooldown,
            usage,
            notify,
            forwarder,
        }
    }

    pub fn is_running(&self) -> bool {
        self.monitor.is_running()
            && self.cooldown.is_running()
            && self.usage.is_running()
            && self.notify.is_running()
    }

    /// Stops every service in reverse creation order.
    ///
    /// All services are cancelled before the first one is awaited, so no
    /// callback fires once teardown has begun.
    pub async fn teardown(self) -> TeardownReport {
        self.cancel.cancel();
        let mut report = TeardownReport::new();

        report.record("event forwarder", self.forwarder.stop().await);
        report.record("notification dispatcher", self.notify.stop().await);
        report.record("usage tracker", self.usage.stop().await);
        report.record("cooldown monitor", self.cooldown.stop().await);
        report.record("state transition monitor", self.monitor.stop().await);

        tracing::info!(
            session_id = %self.session_id,
            clean = report.is_clean(),
            "Session services stopped"
        );
        report
    }
}

/// Republishes lifecycle and cooled events on the registry-wide feed.
fn spawn_forwarder(
    mut events: broadcast::Receiver<MonitorEvent>,
    mut cooled: broadcast::Receiver<CooledEvent>,
    out: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> ServiceHandle {
    let mut service = ServiceHandle::new("event forwarder", cancel.clone());
    let handle = tokio::spawn(async move {
        let mut cooled_open = true;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = recv_event(&mut events, "event forwarder") => match event {
                    Some(MonitorEvent::Lifecycle(event)) => SessionEvent::Lifecycle(event),
                    Some(_) => continue,
                    None => break,
                },
                event = recv_event(&mut cooled, "event forwarder"), if cooled_open => match event {
                    Some(event) => SessionEvent::Cooled(event),
                    None => {
                        cooled_open = false;
                        continue;
                    }
                },
            };
            let _ = out.send(event);
        }
    });
    service.attach(handle);
    service
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{BroadcastSink, MemoryLedger};
    use protocol::{LifecycleKind, NotificationKind};
    use std::time::Duration;
    use tokio::time::timeout;

    fn context(ledger: Arc<MemoryLedger>, sink: BroadcastSink) -> (ServiceContext, broadcast::Receiver<SessionEvent>) {
        let (session_events, rx) = broadcast::channel(64);
        let (_settings_tx, settings) = watch::channel(NotificationSettings::default());
        let ctx = ServiceContext {
            cooldown: CooldownConfig {
                threshold_c: 35.0,
                poll_interval_secs: 1,
                max_wait_secs: 0,
            },
            ledger,
            sinks: vec![Arc::new(sink)],
            settings,
            session_events,
        };
        (ctx, rx)
    }

    #[test]
    fn test_report_keeps_first_error() {
        let mut report = TeardownReport::new();
        report.record::<String>("a", Ok(()));
        report.record("b", Err("boom"));
        report.record("c", Err("later"));
        assert_eq!(report.steps, vec!["a", "b", "c"]);
        assert_eq!(report.first_error.as_deref(), Some("b: boom"));
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_chain_end_to_end() {
        let ledger = Arc::new(MemoryLedger::new());
        let sink = BroadcastSink::new(16);
        let mut decisions = sink.subscribe();
        let (ctx, mut events) = context(ledger.clone(), sink);

        let (tx, rx) = mpsc::channel(16);
        let root = CancellationToken::new();
        let services =
            SessionServices::build("s1", &ctx, rx, &root, Arc::new(AtomicU64::new(0)));
        assert!(services.is_running());

        tx.send(RawStatus::new("idle").with_bed_temp(25.0)).await.unwrap();
        tx.send(
            RawStatus::new("printing")
                .with_job("x.gcode")
                .with_bed_temp(60.0)
                .with_filament_used(10.0),
        )
        .await
        .unwrap();
        tx.send(
            RawStatus::new("completed")
                .with_job("x.gcode")
                .with_bed_temp(30.0)
                .with_filament_used(0.0),
        )
        .await
        .unwrap();

        let mut kinds = Vec::new();
        while kinds.len() < 3 {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timeout")
                .unwrap();
            kinds.push(match event {
                SessionEvent::Lifecycle(e) => format!("{:?}", e.kind),
                SessionEvent::Cooled(_) => "Cooled".to_string(),
            });
        }
        assert_eq!(kinds[0], format!("{:?}", LifecycleKind::Started));
        assert_eq!(kinds[1], format!("{:?}", LifecycleKind::Completed));
        assert_eq!(kinds[2], "Cooled");

        let mut notified = Vec::new();
        while notified.len() < 2 {
            let decision = timeout(Duration::from_secs(2), decisions.recv())
                .await
                .expect("timeout")
                .unwrap();
            notified.push(decision.kind);
        }
        assert!(notified.contains(&NotificationKind::PrintComplete));
        assert!(notified.contains(&NotificationKind::Cooled));

        timeout(Duration::from_secs(1), async {
            while ledger.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no deduction");
        assert_eq!(ledger.calls(), vec![("x.gcode".to_string(), 10.0)]);

        let report = services.teardown().await;
        assert!(report.is_clean());
        assert_eq!(
            report.steps,
            vec![
                "event forwarder",
                "notification dispatcher",
                "usage tracker",
                "cooldown monitor",
                "state transition monitor"
            ]
        );
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_chain() {
        let (ctx, _events) = context(Arc::new(MemoryLedger::new()), BroadcastSink::new(4));
        let (_tx, rx) = mpsc::channel(4);
        let root = CancellationToken::new();
        let services = SessionServices::build("s1", &ctx, rx, &root, Arc::new(AtomicU64::new(0)));

        root.cancel();
        let report = timeout(Duration::from_secs(1), services.teardown())
            .await
            .expect("teardown hung");
        assert!(report.is_clean());
    }
}
