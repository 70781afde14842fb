//! End-to-end integration tests for printhub.
//!
//! These tests drive the hub through its public API with in-memory devices,
//! camera sources and usage ledgers:
//! - Session lifecycle and the active pointer
//! - Job lifecycle detection, usage deduction and notifications
//! - Camera stream keep-alive, fan-out and port allocation

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use daemon::config::Config;
use daemon::device::{DeviceIdentity, ManualConnector};
use daemon::monitor::{BroadcastSink, MemoryLedger};
use daemon::orchestrator::{HubComponents, HubOrchestrator};
use daemon::session::SessionRegistry;
use daemon::stream::{ClientKind, MemoryUpstream, StreamManager};
use protocol::{
    ConnectionState, LifecycleKind, NotificationDecision, NotificationKind, RawStatus,
    SessionEvent, StreamStatus,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

struct Hub {
    orchestrator: HubOrchestrator,
    connector: Arc<ManualConnector>,
    upstream: Arc<MemoryUpstream>,
    ledger: Arc<MemoryLedger>,
    notifications: broadcast::Receiver<NotificationDecision>,
}

impl Hub {
    async fn start() -> Self {
        let mut config = Config::default();
        config.stream.serve_downstream = false;
        config.stream.initial_backoff_ms = 10;
        config.stream.max_backoff_ms = 100;
        config.session.reconnect_initial_ms = 10;
        config.session.reconnect_max_ms = 100;
        config.cooldown.poll_interval_secs = 1;

        let connector = Arc::new(ManualConnector::new());
        let upstream = Arc::new(MemoryUpstream::new());
        let ledger = Arc::new(MemoryLedger::new());
        let sink = BroadcastSink::new(64);
        let notifications = sink.subscribe();

        let mut orchestrator = HubOrchestrator::with_components(
            config,
            HubComponents {
                connector: connector.clone(),
                upstream: upstream.clone(),
                ledger: ledger.clone(),
                sinks: vec![Arc::new(sink)],
            },
        );
        orchestrator.start().await.unwrap();

        Self {
            orchestrator,
            connector,
            upstream,
            ledger,
            notifications,
        }
    }

    fn registry(&self) -> &Arc<SessionRegistry> {
        self.orchestrator.registry()
    }

    fn streams(&self) -> &Arc<StreamManager> {
        self.registry().streams()
    }

    /// Creates a session and waits until its device is connected.
    async fn connected_session(&self, name: &str) -> String {
        let identity = DeviceIdentity::new(name, format!("{}.local", name))
            .with_camera_url(format!("http://{}.local/webcam", name));
        let id = self.registry().create_session(identity).await.unwrap();

        let registry = Arc::clone(self.registry());
        let probe = id.clone();
        eventually("session connected", move || {
            let registry = Arc::clone(&registry);
            let probe = probe.clone();
            async move {
                registry.get(&probe).await.map(|s| s.state) == Some(ConnectionState::Connected)
            }
        })
        .await;
        id
    }

    fn feed(&self, name: &str) -> mpsc::Sender<RawStatus> {
        self.connector.feed(name).expect("device not connected")
    }

    async fn stop(mut self) {
        self.orchestrator.stop().await.unwrap();
    }
}

/// Polls `check` until it returns true, failing after two seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = timeout(Duration::from_secs(2), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

/// Collects lifecycle kinds until `count` have been seen.
async fn lifecycle_kinds(
    events: &mut broadcast::Receiver<SessionEvent>,
    count: usize,
) -> Vec<LifecycleKind> {
    let mut kinds = Vec::new();
    while kinds.len() < count {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .unwrap();
        if let SessionEvent::Lifecycle(event) = event {
            kinds.push(event.kind);
        }
    }
    kinds
}

// =============================================================================
// Job lifecycle, usage and notifications
// =============================================================================

#[tokio::test]
async fn test_cached_usage_deducted_once_on_completion() {
    let mut hub = Hub::start().await;
    let mut events = hub.registry().subscribe_lifecycle();
    hub.connected_session("a").await;
    let feed = hub.feed("a");

    feed.send(RawStatus::new("idle").with_bed_temp(24.0)).await.unwrap();
    feed.send(
        RawStatus::new("printing")
            .with_job("x.gcode")
            .with_bed_temp(60.0)
            .with_filament_used(4.0),
    )
    .await
    .unwrap();
    feed.send(
        RawStatus::new("printing")
            .with_job("x.gcode")
            .with_bed_temp(60.0)
            .with_filament_used(10.0),
    )
    .await
    .unwrap();
    // The device zeroes its counters once the job is done.
    for _ in 0..2 {
        feed.send(
            RawStatus::new("completed")
                .with_job("x.gcode")
                .with_bed_temp(58.0)
                .with_filament_used(0.0),
        )
        .await
        .unwrap();
    }

    assert_eq!(
        lifecycle_kinds(&mut events, 2).await,
        vec![LifecycleKind::Started, LifecycleKind::Completed]
    );

    let ledger = hub.ledger.clone();
    eventually("deduction", move || {
        let ledger = ledger.clone();
        async move { !ledger.calls().is_empty() }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.ledger.calls(), vec![("x.gcode".to_string(), 10.0)]);

    let decision = timeout(Duration::from_secs(1), hub.notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(decision.kind, NotificationKind::PrintComplete);
    assert_eq!(decision.job.as_deref(), Some("x.gcode"));
    assert!(hub.notifications.try_recv().is_err());

    hub.stop().await;
}

#[tokio::test]
async fn test_usage_on_the_opening_sample_is_deducted() {
    let hub = Hub::start().await;
    hub.connected_session("a").await;
    let feed = hub.feed("a");

    feed.send(RawStatus::new("idle")).await.unwrap();
    feed.send(RawStatus::new("printing").with_job("x.gcode").with_filament_used(10.0))
        .await
        .unwrap();
    feed.send(RawStatus::new("completed").with_job("x.gcode").with_filament_used(0.0))
        .await
        .unwrap();

    let ledger = hub.ledger.clone();
    eventually("deduction", move || {
        let ledger = ledger.clone();
        async move { !ledger.calls().is_empty() }
    })
    .await;
    assert_eq!(hub.ledger.calls(), vec![("x.gcode".to_string(), 10.0)]);

    hub.stop().await;
}

#[tokio::test]
async fn test_started_and_terminal_events_balance() {
    let hub = Hub::start().await;
    let mut events = hub.registry().subscribe_lifecycle();
    hub.connected_session("a").await;
    let feed = hub.feed("a");

    let samples = [
        RawStatus::new("idle"),
        RawStatus::new("printing").with_job("a.gcode"),
        RawStatus::new("paused").with_job("a.gcode"),
        RawStatus::new("printing").with_job("a.gcode"),
        RawStatus::new("completed").with_job("a.gcode"),
        RawStatus::new("idle"),
        RawStatus::new("bogus-state"),
        RawStatus::new("printing").with_job("b.gcode"),
        RawStatus::new("error").with_job("b.gcode"),
        RawStatus::new("idle"),
        RawStatus::new("printing").with_job("c.gcode"),
        RawStatus::new("cancelled").with_job("c.gcode"),
        RawStatus::new("idle"),
    ];
    for sample in samples {
        feed.send(sample).await.unwrap();
    }

    let kinds = lifecycle_kinds(&mut events, 6).await;
    assert_eq!(
        kinds,
        vec![
            LifecycleKind::Started,
            LifecycleKind::Completed,
            LifecycleKind::Started,
            LifecycleKind::Error,
            LifecycleKind::Started,
            LifecycleKind::Cancelled,
        ]
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    hub.stop().await;
}

#[tokio::test]
async fn test_print_complete_then_cooled() {
    let mut hub = Hub::start().await;
    hub.connected_session("a").await;
    let feed = hub.feed("a");

    feed.send(RawStatus::new("idle").with_bed_temp(25.0)).await.unwrap();
    feed.send(RawStatus::new("printing").with_job("x.gcode").with_bed_temp(60.0))
        .await
        .unwrap();
    feed.send(RawStatus::new("completed").with_job("x.gcode").with_bed_temp(30.0))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while kinds.len() < 2 {
        let decision = timeout(Duration::from_secs(3), hub.notifications.recv())
            .await
            .unwrap()
            .unwrap();
        kinds.push(decision.kind);
    }
    assert_eq!(kinds, vec![NotificationKind::PrintComplete, NotificationKind::Cooled]);

    hub.stop().await;
}

// =============================================================================
// Camera streams
// =============================================================================

#[tokio::test]
async fn test_keepalive_survives_visible_client_detach() {
    let hub = Hub::start().await;
    let a = hub.connected_session("a").await;
    hub.registry().switch_active(&a).await.unwrap();
    assert!(hub.streams().keepalive(&a).await.unwrap());

    let mut lease = hub.streams().request_client(&a, ClientKind::Visible).await.unwrap();
    let mut receiver = lease.receiver.take().unwrap();

    let upstream = hub.upstream.clone();
    eventually("upstream open", move || {
        let upstream = upstream.clone();
        async move { upstream.active_streams() == 1 }
    })
    .await;
    hub.upstream.push(Bytes::from_static(b"frame-1"));
    let chunk = timeout(Duration::from_secs(1), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk, Bytes::from_static(b"frame-1"));

    hub.streams().release_client(&a, &lease.id).await.unwrap();
    drop(receiver);

    assert!(hub.streams().is_streaming(&a).await.unwrap());
    assert!(hub.streams().keepalive(&a).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.upstream.active_streams(), 1);

    hub.stop().await;
}

#[tokio::test]
async fn test_switch_moves_the_single_keepalive() {
    let hub = Hub::start().await;
    let a = hub.connected_session("a").await;
    let b = hub.connected_session("b").await;

    hub.registry().switch_active(&a).await.unwrap();
    let mut a_status = hub.streams().subscribe_status(&a).await.unwrap();

    let previous = hub.registry().switch_active(&b).await.unwrap();
    assert_eq!(previous, Some(a.clone()));

    // A had no other clients, so its stream is already down.
    assert_eq!(*a_status.borrow_and_update(), StreamStatus::Idle);
    assert!(!hub.streams().keepalive(&a).await.unwrap());
    assert!(!hub.streams().is_streaming(&a).await.unwrap());
    assert!(hub.streams().keepalive(&b).await.unwrap());

    let mut keepalives = 0;
    for session in hub.registry().list().await {
        if hub.streams().keepalive(&session.id).await.unwrap() {
            keepalives += 1;
        }
    }
    assert_eq!(keepalives, 1);

    let active: Vec<_> = hub
        .registry()
        .list()
        .await
        .into_iter()
        .filter(|s| s.is_active)
        .map(|s| s.id)
        .collect();
    assert_eq!(active, vec![b.clone()]);

    hub.stop().await;
}

#[tokio::test]
async fn test_live_stream_sessions_get_distinct_ports() {
    let hub = Hub::start().await;
    let mut ports = HashSet::new();
    let mut leases = Vec::new();
    for name in ["a", "b", "c", "d"] {
        let id = hub.connected_session(name).await;
        assert_eq!(hub.registry().get(&id).await.unwrap().camera_port, None);

        leases.push(hub.streams().request_client(&id, ClientKind::Other).await.unwrap());
        let port = hub.registry().get(&id).await.unwrap().camera_port.unwrap();
        assert!(ports.insert(port), "port {} assigned twice", port);
    }
    assert_eq!(hub.streams().ports().in_use(), 4);

    hub.stop().await;
}

#[tokio::test]
async fn test_releasing_all_clients_closes_upstream_and_frees_port() {
    let hub = Hub::start().await;
    let a = hub.connected_session("a").await;

    let first = hub.streams().request_client(&a, ClientKind::Other).await.unwrap();
    let second = hub.streams().request_client(&a, ClientKind::Visible).await.unwrap();
    let port = hub.streams().port(&a).await.unwrap().unwrap();
    let upstream = hub.upstream.clone();
    eventually("upstream open", move || {
        let upstream = upstream.clone();
        async move { upstream.active_streams() == 1 }
    })
    .await;

    hub.streams().release_client(&a, &first.id).await.unwrap();
    assert!(hub.streams().is_streaming(&a).await.unwrap());
    hub.streams().release_client(&a, &second.id).await.unwrap();
    assert!(!hub.streams().is_streaming(&a).await.unwrap());
    assert_eq!(hub.streams().status(&a).await.unwrap(), StreamStatus::Idle);
    assert!(!hub.streams().ports().is_allocated(port));
    assert_eq!(hub.registry().get(&a).await.unwrap().camera_port, None);

    let upstream = hub.upstream.clone();
    eventually("upstream closed", move || {
        let upstream = upstream.clone();
        async move { upstream.active_streams() == 0 }
    })
    .await;

    // A new viewer brings the stream back on a fresh allocation.
    let third = hub.streams().request_client(&a, ClientKind::Visible).await.unwrap();
    assert!(hub.streams().port(&a).await.unwrap().is_some());
    assert_eq!(hub.streams().ports().in_use(), 1);
    hub.streams().release_client(&a, &third.id).await.unwrap();
    assert_eq!(hub.streams().ports().in_use(), 0);

    hub.stop().await;
}

// =============================================================================
// Session lifecycle
// =============================================================================

#[tokio::test]
async fn test_remove_session_tears_down_in_reverse_order() {
    let hub = Hub::start().await;
    let a = hub.connected_session("a").await;
    hub.registry().switch_active(&a).await.unwrap();

    let report = hub.registry().remove_session(&a).await.unwrap();
    assert_eq!(
        report.steps,
        vec![
            "event forwarder",
            "notification dispatcher",
            "usage tracker",
            "cooldown monitor",
            "state transition monitor",
            "stream session",
        ]
    );
    assert!(!hub.registry().exists(&a));
    assert_eq!(hub.registry().active(), None);
    assert_eq!(hub.streams().ports().in_use(), 0);

    // Samples sent after removal go nowhere.
    assert!(hub.connector.feed("a").map_or(true, |feed| feed.is_closed()));

    hub.stop().await;
}

#[tokio::test]
async fn test_stop_removes_all_sessions() {
    let hub = Hub::start().await;
    hub.connected_session("a").await;
    hub.connected_session("b").await;
    let registry = Arc::clone(hub.registry());

    hub.stop().await;
    assert_eq!(registry.count(), 0);
    assert_eq!(registry.streams().ports().in_use(), 0);
}
