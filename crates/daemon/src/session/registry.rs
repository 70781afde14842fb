//! Session registry.
//!
//! The registry is the sole owner of every [`Session`]. Mutations of the
//! session map and the active pointer are serialized through a single writer
//! lock; per-session state sits behind its own mutex so one session's slow
//! teardown never blocks reads of another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use protocol::{
    now_millis, ConnectionState, NotificationSettings, RawStatus, RegistryEvent, SessionEvent,
    SessionId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::services::{ServiceContext, SessionServices, TeardownReport};
use super::SessionError;
use crate::backoff::Backoff;
use crate::config::{CooldownConfig, SessionConfig};
use crate::device::{DeviceConnector, DeviceError, DeviceIdentity};
use crate::monitor::{NotificationSink, UsageLedger};
use crate::stream::{validate_stream_url, StreamError, StreamManager};

/// Capacity of the registry event channels.
const EVENT_CAPACITY: usize = 256;

/// Capacity of the relay between a device feed and the monitor.
const RELAY_CAPACITY: usize = 32;

/// Collaborators the registry wires into each session.
pub struct RegistryDeps {
    pub connector: Arc<dyn DeviceConnector>,
    pub streams: Arc<StreamManager>,
    pub ledger: Arc<dyn UsageLedger>,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
    pub settings: watch::Receiver<NotificationSettings>,
}

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub host: String,
    pub state: ConnectionState,
    pub is_active: bool,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds of the last valid status sample.
    pub last_activity: u64,
    /// Held only while the camera stream has clients.
    pub camera_port: Option<u16>,
    pub services_running: bool,
}

/// One managed printer connection.
pub struct Session {
    id: SessionId,
    identity: DeviceIdentity,
    state: ConnectionState,
    is_active: bool,
    created_at: u64,
    last_activity: Arc<AtomicU64>,
    /// Present iff the device is connected.
    services: Option<SessionServices>,
    cancel: CancellationToken,
    connection: Option<JoinHandle<()>>,
}

impl Session {
    /// Snapshot without the camera port, which the stream manager owns.
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.identity.name.clone(),
            host: self.identity.host.clone(),
            state: self.state,
            is_active: self.is_active,
            created_at: self.created_at,
            last_activity: self.last_activity.load(Ordering::Relaxed),
            camera_port: None,
            services_running: self.services.is_some(),
        }
    }
}

/// Owns every session and the active pointer.
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    active: StdRwLock<Option<SessionId>>,
    writer: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
    connector: Arc<dyn DeviceConnector>,
    streams: Arc<StreamManager>,
    services: ServiceContext,
    cancel: CancellationToken,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, cooldown: CooldownConfig, deps: RegistryDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (session_events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            sessions: DashMap::new(),
            active: StdRwLock::new(None),
            writer: Mutex::new(()),
            events,
            connector: deps.connector,
            streams: deps.streams,
            services: ServiceContext {
                cooldown,
                ledger: deps.ledger,
                sinks: deps.sinks,
                settings: deps.settings,
                session_events,
            },
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribes to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Subscribes to lifecycle and cooled events of every session.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<SessionEvent> {
        self.services.session_events.subscribe()
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Creates a session and starts connecting to its device.
    pub async fn create_session(
        self: &Arc<Self>,
        identity: DeviceIdentity,
    ) -> Result<SessionId, SessionError> {
        identity.validate().map_err(|e| match e {
            DeviceError::InvalidIdentity(reason) => SessionError::InvalidIdentity(reason),
            other => SessionError::InvalidIdentity(other.to_string()),
        })?;

        let _guard = self.writer.lock().await;
        if self.sessions.len() >= self.config.max_sessions {
            return Err(SessionError::LimitReached(self.config.max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let cancel = self.cancel.child_token();
        let now = now_millis();
        let name = identity.name.clone();

        let session = Arc::new(Mutex::new(Session {
            id: id.clone(),
            identity: identity.clone(),
            state: ConnectionState::Connecting,
            is_active: false,
            created_at: now,
            last_activity: Arc::new(AtomicU64::new(now)),
            services: None,
            cancel: cancel.clone(),
            connection: None,
        }));
        self.sessions.insert(id.clone(), Arc::clone(&session));

        let handle = tokio::spawn(run_connection(
            Arc::downgrade(self),
            id.clone(),
            identity,
            cancel,
        ));
        session.lock().await.connection = Some(handle);

        tracing::info!(session_id = %id, name = %name, "Created session");
        self.emit(RegistryEvent::Created {
            session_id: id.clone(),
            name,
        });
        Ok(id)
    }

    /// Makes `session_id` the active session.
    ///
    /// The previous session's keep-alive is disabled before the target's is
    /// enabled. Returns the previously active session.
    pub async fn switch_active(&self, session_id: &str) -> Result<Option<SessionId>, SessionError> {
        let _guard = self.writer.lock().await;
        let target = self.get_arc(session_id)?;
        let previous = self.active_id();

        if let Some(prev_id) = previous.as_deref().filter(|p| *p != session_id) {
            if let Ok(prev) = self.get_arc(prev_id) {
                let mut prev = prev.lock().await;
                prev.is_active = false;
                self.apply_keepalive(prev_id, false).await;
            }
        }

        {
            let mut target = target.lock().await;
            target.is_active = true;
            if self.config.keepalive_active {
                self.apply_keepalive(session_id, true).await;
            }
        }
        self.set_active(Some(session_id.to_string()));

        tracing::info!(
            session_id = %session_id,
            previous = previous.as_deref().unwrap_or("-"),
            "Switched active session"
        );
        self.emit(RegistryEvent::Switched {
            previous: previous.clone(),
            current: session_id.to_string(),
        });
        Ok(previous)
    }

    /// Removes a session, tearing down everything it owns.
    ///
    /// Teardown is best-effort; the report carries the first failure.
    pub async fn remove_session(&self, session_id: &str) -> Result<TeardownReport, SessionError> {
        let _guard = self.writer.lock().await;
        let session = self.get_arc(session_id)?;

        let connection = {
            let mut session = session.lock().await;
            session.cancel.cancel();
            session.connection.take()
        };
        if let Some(handle) = connection {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(session_id = %session_id, "Connection task panicked: {}", e);
                }
            }
        }

        let report = {
            let mut session = session.lock().await;
            let report = self.teardown_dependents(&mut session).await;
            session.state = ConnectionState::Disconnected;
            session.is_active = false;
            report
        };

        self.sessions.remove(session_id);
        if self.active_id().as_deref() == Some(session_id) {
            self.set_active(None);
        }

        if let Some(error) = &report.first_error {
            tracing::warn!(session_id = %session_id, "Session removed with teardown error: {}", error);
        } else {
            tracing::info!(session_id = %session_id, "Removed session");
        }
        self.emit(RegistryEvent::Removed {
            session_id: session_id.to_string(),
        });
        Ok(report)
    }

    /// Builds the service chain for a freshly connected device.
    pub async fn mark_connected(
        &self,
        session_id: &str,
        feed: mpsc::Receiver<RawStatus>,
    ) -> Result<(), SessionError> {
        let session = self.get_arc(session_id)?;
        let mut session = session.lock().await;
        if session.cancel.is_cancelled() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        if session.services.is_some() {
            let report = self.teardown_dependents(&mut session).await;
            tracing::debug!(session_id = %session_id, clean = report.is_clean(), "Replaced stale services");
        }

        let services = SessionServices::build(
            session_id,
            &self.services,
            feed,
            &session.cancel,
            Arc::clone(&session.last_activity),
        );
        session.services = Some(services);

        if let Some(url) = session.identity.camera_url.clone() {
            match self.streams.open(session_id, &url).await {
                Ok(()) => {
                    if session.is_active && self.config.keepalive_active {
                        self.apply_keepalive(session_id, true).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, "Camera stream unavailable: {}", e);
                }
            }
        }

        session.state = ConnectionState::Connected;
        drop(session);

        tracing::info!(session_id = %session_id, "Device connected");
        self.emit(RegistryEvent::ConnectionChanged {
            session_id: session_id.to_string(),
            state: ConnectionState::Connected,
        });
        Ok(())
    }

    /// Tears down the service chain after the device link dropped.
    pub async fn mark_disconnected(
        &self,
        session_id: &str,
        state: ConnectionState,
    ) -> Result<TeardownReport, SessionError> {
        let session = self.get_arc(session_id)?;
        let report = {
            let mut session = session.lock().await;
            let report = self.teardown_dependents(&mut session).await;
            session.state = state;
            report
        };

        tracing::info!(session_id = %session_id, state = ?state, "Device disconnected");
        self.emit(RegistryEvent::ConnectionChanged {
            session_id: session_id.to_string(),
            state,
        });
        Ok(report)
    }

    /// Enables or disables keep-alive on a session's stream.
    ///
    /// Returns the camera port the stream holds afterwards.
    pub async fn set_keepalive(
        &self,
        session_id: &str,
        enabled: bool,
    ) -> Result<Option<u16>, SessionError> {
        self.get_arc(session_id)?;
        let port = self.streams.set_keepalive(session_id, enabled).await?;
        Ok(port)
    }

    /// Points a session's camera at a new URL.
    ///
    /// Returns the new camera port. It is `None` when the stream has no
    /// clients, or when the device is not connected yet and the URL will be
    /// used on connect.
    pub async fn reassign_stream_url(
        &self,
        session_id: &str,
        url: &str,
    ) -> Result<Option<u16>, SessionError> {
        validate_stream_url(url)?;
        let session = self.get_arc(session_id)?;
        let mut session = session.lock().await;
        session.identity.camera_url = Some(url.to_string());

        if self.streams.contains(session_id) {
            return Ok(self.streams.reassign_stream_url(session_id, url).await?);
        }

        if session.state != ConnectionState::Connected {
            return Ok(None);
        }

        self.streams.open(session_id, url).await?;
        if session.is_active && self.config.keepalive_active {
            self.apply_keepalive(session_id, true).await;
        }
        Ok(self.streams.port(session_id).await?)
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        let session = self.get_arc(session_id).ok()?;
        let info = session.lock().await.info();
        Some(self.with_camera_port(info).await)
    }

    /// Lists all sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            let info = session.lock().await.info();
            infos.push(self.with_camera_port(info).await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Returns the active session id.
    pub fn active(&self) -> Option<SessionId> {
        self.active_id()
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Removes every session and stops background work.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            match self.remove_session(&id).await {
                Ok(_) | Err(SessionError::NotFound(_)) => {}
                Err(e) => tracing::warn!(session_id = %id, "Failed to remove session: {}", e),
            }
        }
        self.streams.shutdown().await;
        self.cancel.cancel();
        tracing::info!("Session registry shut down");
    }

    async fn set_connection_state(&self, session_id: &str, state: ConnectionState) {
        let Ok(session) = self.get_arc(session_id) else {
            return;
        };
        let changed = {
            let mut session = session.lock().await;
            let changed = session.state != state;
            session.state = state;
            changed
        };
        if changed {
            self.emit(RegistryEvent::ConnectionChanged {
                session_id: session_id.to_string(),
                state,
            });
        }
    }

    async fn teardown_dependents(&self, session: &mut Session) -> TeardownReport {
        let mut report = TeardownReport::new();
        if let Some(services) = session.services.take() {
            report.merge(services.teardown().await);
        }
        if self.streams.contains(&session.id) {
            let closed = self.streams.close(&session.id).await.map(|_| ());
            report.record("stream session", closed);
        }
        report
    }

    async fn with_camera_port(&self, mut info: SessionInfo) -> SessionInfo {
        info.camera_port = self.streams.port(&info.id).await.ok().flatten();
        info
    }

    async fn apply_keepalive(&self, session_id: &str, enabled: bool) {
        match self.streams.set_keepalive(session_id, enabled).await {
            Ok(_) | Err(StreamError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(session_id = %session_id, enabled, "Failed to set keep-alive: {}", e)
            }
        }
    }

    fn get_arc(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    fn active_id(&self) -> Option<SessionId> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_active(&self, id: Option<SessionId>) {
        *self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = id;
    }

    fn emit(&self, event: RegistryEvent) {
        tracing::debug!(event = ?event, "Registry event");
        let _ = self.events.send(event);
    }
}

/// Keeps a session connected to its device.
///
/// Samples are relayed to the session's monitor so the loop notices when the
/// device feed ends.
async fn run_connection(
    registry: Weak<SessionRegistry>,
    session_id: SessionId,
    identity: DeviceIdentity,
    cancel: CancellationToken,
) {
    let Some(mut backoff) = registry.upgrade().map(|r| {
        Backoff::new(
            Duration::from_millis(r.config.reconnect_initial_ms),
            Duration::from_millis(r.config.reconnect_max_ms),
        )
    }) else {
        return;
    };

    loop {
        let Some(connector) = registry.upgrade().map(|r| Arc::clone(&r.connector)) else {
            break;
        };
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connector.connect(&identity) => result,
        };

        match connected {
            Ok(mut device_feed) => {
                backoff.reset();
                let (relay, feed) = mpsc::channel(RELAY_CAPACITY);
                let Some(reg) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = reg.mark_connected(&session_id, feed).await {
                    tracing::debug!(session_id = %session_id, "Connection abandoned: {}", e);
                    break;
                }
                drop(reg);

                loop {
                    let sample = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        sample = device_feed.recv() => sample,
                    };
                    match sample {
                        Some(sample) => {
                            if relay.send(sample).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }

                let Some(reg) = registry.upgrade() else {
                    break;
                };
                tracing::warn!(session_id = %session_id, "Device link lost");
                let _ = reg
                    .mark_disconnected(&session_id, ConnectionState::Disconnected)
                    .await;

                if !reg.config.auto_reconnect {
                    // Removal awaits this task, so it runs on its own.
                    let id = session_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = reg.remove_session(&id).await {
                            tracing::debug!(session_id = %id, "Removal after disconnect: {}", e);
                        }
                    });
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    attempt = backoff.attempts() + 1,
                    "Device connection failed: {}",
                    e
                );
                if let Some(reg) = registry.upgrade() {
                    reg.set_connection_state(&session_id, ConnectionState::Error)
                        .await;
                }
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(session_id = %session_id, "Connection task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::device::ManualConnector;
    use crate::monitor::{BroadcastSink, MemoryLedger};
    use crate::stream::MemoryUpstream;
    use protocol::LifecycleKind;
    use tokio::time::timeout;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        connector: Arc<ManualConnector>,
        streams: Arc<StreamManager>,
        _settings: watch::Sender<NotificationSettings>,
    }

    fn fixture(config: SessionConfig) -> Fixture {
        let connector = Arc::new(ManualConnector::new());
        let streams = Arc::new(StreamManager::new(
            StreamConfig {
                serve_downstream: false,
                initial_backoff_ms: 10,
                max_backoff_ms: 50,
                ..StreamConfig::default()
            },
            Arc::new(MemoryUpstream::new()),
        ));
        let (settings_tx, settings) = watch::channel(NotificationSettings::default());
        let registry = Arc::new(SessionRegistry::new(
            config,
            CooldownConfig::default(),
            RegistryDeps {
                connector: connector.clone(),
                streams: streams.clone(),
                ledger: Arc::new(MemoryLedger::new()),
                sinks: vec![Arc::new(BroadcastSink::new(8))],
                settings,
            },
        ));
        Fixture {
            registry,
            connector,
            streams,
            _settings: settings_tx,
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            reconnect_initial_ms: 10,
            reconnect_max_ms: 50,
            ..SessionConfig::default()
        }
    }

    fn printer(name: &str) -> DeviceIdentity {
        DeviceIdentity::new(name, format!("{}.local", name))
            .with_camera_url(format!("http://{}.local/webcam", name))
    }

    async fn wait_for_state(registry: &SessionRegistry, id: &str, state: ConnectionState) {
        timeout(Duration::from_secs(2), async {
            loop {
                if registry.get(id).await.map(|s| s.state) == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session did not reach state");
    }

    #[tokio::test]
    async fn test_create_session_connects() {
        let f = fixture(fast_config());
        let mut events = f.registry.subscribe();

        let id = f.registry.create_session(printer("voron")).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Created { ref session_id, .. } if *session_id == id
        ));

        wait_for_state(&f.registry, &id, ConnectionState::Connected).await;
        let info = f.registry.get(&id).await.unwrap();
        assert!(info.services_running);
        assert!(!info.is_active);
        assert_eq!(f.registry.count(), 1);

        // The camera takes a port only once something watches it.
        assert_eq!(info.camera_port, None);
        f.registry.switch_active(&id).await.unwrap();
        assert!(f.registry.get(&id).await.unwrap().camera_port.is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_identity() {
        let f = fixture(fast_config());
        let result = f
            .registry
            .create_session(DeviceIdentity::new("", "host"))
            .await;
        assert!(matches!(result, Err(SessionError::InvalidIdentity(_))));
        assert_eq!(f.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_limit_reached() {
        let f = fixture(SessionConfig {
            max_sessions: 1,
            ..fast_config()
        });
        f.registry.create_session(printer("a")).await.unwrap();
        assert!(matches!(
            f.registry.create_session(printer("b")).await,
            Err(SessionError::LimitReached(1))
        ));
    }

    #[tokio::test]
    async fn test_switch_moves_keepalive() {
        let f = fixture(fast_config());
        let a = f.registry.create_session(printer("a")).await.unwrap();
        let b = f.registry.create_session(printer("b")).await.unwrap();
        wait_for_state(&f.registry, &a, ConnectionState::Connected).await;
        wait_for_state(&f.registry, &b, ConnectionState::Connected).await;

        assert_eq!(f.registry.switch_active(&a).await.unwrap(), None);
        assert!(f.streams.keepalive(&a).await.unwrap());
        assert!(f.streams.is_streaming(&a).await.unwrap());

        let mut events = f.registry.subscribe();
        assert_eq!(f.registry.switch_active(&b).await.unwrap(), Some(a.clone()));
        assert!(!f.streams.keepalive(&a).await.unwrap());
        assert!(!f.streams.is_streaming(&a).await.unwrap());
        assert_eq!(f.streams.port(&a).await.unwrap(), None);
        assert!(f.streams.keepalive(&b).await.unwrap());
        assert_eq!(f.streams.ports().in_use(), 1);
        assert_eq!(f.registry.active(), Some(b.clone()));

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Switched {
                previous: Some(a.clone()),
                current: b.clone()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_switch_to_same_session() {
        let f = fixture(fast_config());
        let a = f.registry.create_session(printer("a")).await.unwrap();
        f.registry.switch_active(&a).await.unwrap();

        let mut events = f.registry.subscribe();
        f.registry.switch_active(&a).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Switched {
                previous: Some(a.clone()),
                current: a.clone()
            }
        );
        assert!(matches!(
            f.registry.switch_active("missing").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_keepalive_applied_on_connect_when_active() {
        let f = fixture(fast_config());
        f.connector.set_failing(true);
        let a = f.registry.create_session(printer("a")).await.unwrap();
        f.registry.switch_active(&a).await.unwrap();
        assert!(!f.streams.contains(&a));

        f.connector.set_failing(false);
        wait_for_state(&f.registry, &a, ConnectionState::Connected).await;
        assert!(f.streams.keepalive(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_session() {
        let f = fixture(fast_config());
        let a = f.registry.create_session(printer("a")).await.unwrap();
        wait_for_state(&f.registry, &a, ConnectionState::Connected).await;
        f.registry.switch_active(&a).await.unwrap();
        let port = f.registry.get(&a).await.unwrap().camera_port.unwrap();

        let mut events = f.registry.subscribe();
        let report = f.registry.remove_session(&a).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.steps.first(), Some(&"event forwarder"));
        assert_eq!(report.steps.last(), Some(&"stream session"));

        assert!(!f.registry.exists(&a));
        assert_eq!(f.registry.active(), None);
        assert!(!f.streams.ports().is_allocated(port));
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Removed {
                session_id: a.clone()
            }
        );
        assert!(matches!(
            f.registry.remove_session(&a).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_reconnects() {
        let f = fixture(fast_config());
        let a = f.registry.create_session(printer("a")).await.unwrap();
        wait_for_state(&f.registry, &a, ConnectionState::Connected).await;

        let mut events = f.registry.subscribe();
        assert!(f.connector.disconnect("a"));
        timeout(Duration::from_secs(2), async {
            loop {
                if let RegistryEvent::ConnectionChanged {
                    state: ConnectionState::Disconnected,
                    ..
                } = events.recv().await.unwrap()
                {
                    return;
                }
            }
        })
        .await
        .expect("no disconnect event");

        wait_for_state(&f.registry, &a, ConnectionState::Connected).await;
        assert_eq!(f.connector.connect_count(), 2);
        assert!(f.registry.get(&a).await.unwrap().services_running);
    }

    async fn next_lifecycle(events: &mut broadcast::Receiver<SessionEvent>) -> LifecycleKind {
        timeout(Duration::from_secs(2), async {
            loop {
                if let SessionEvent::Lifecycle(event) = events.recv().await.unwrap() {
                    return event.kind;
                }
            }
        })
        .await
        .expect("no lifecycle event")
    }

    #[tokio::test]
    async fn test_job_finishing_after_reconnect_completes() {
        let f = fixture(fast_config());
        let mut lifecycle = f.registry.subscribe_lifecycle();
        let a = f.registry.create_session(printer("a")).await.unwrap();
        wait_for_state(&f.registry, &a, ConnectionState::Connected).await;

        let feed = f.connector.feed("a").unwrap();
        feed.send(RawStatus::new("idle")).await.unwrap();
        feed.send(RawStatus::new("printing").with_job("x.gcode")).await.unwrap();
        assert_eq!(next_lifecycle(&mut lifecycle).await, LifecycleKind::Started);

        let mut events = f.registry.subscribe();
        f.connector.disconnect("a");
        timeout(Duration::from_secs(2), async {
            loop {
                if let RegistryEvent::ConnectionChanged {
                    state: ConnectionState::Connected,
                    ..
                } = events.recv().await.unwrap()
                {
                    return;
                }
            }
        })
        .await
        .expect("no reconnect");

        // The new link's first sample is mid-print.
        let feed = f.connector.feed("a").unwrap();
        feed.send(RawStatus::new("printing").with_job("x.gcode")).await.unwrap();
        feed.send(RawStatus::new("completed").with_job("x.gcode")).await.unwrap();
        assert_eq!(next_lifecycle(&mut lifecycle).await, LifecycleKind::Completed);
    }

    #[tokio::test]
    async fn test_disconnect_without_reconnect_removes() {
        let f = fixture(SessionConfig {
            auto_reconnect: false,
            ..fast_config()
        });
        let a = f.registry.create_session(printer("a")).await.unwrap();
        wait_for_state(&f.registry, &a, ConnectionState::Connected).await;
        f.registry.switch_active(&a).await.unwrap();
        let port = f.registry.get(&a).await.unwrap().camera_port.unwrap();

        f.connector.disconnect("a");
        timeout(Duration::from_secs(2), async {
            while f.registry.exists(&a) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session not removed");
        assert!(!f.streams.ports().is_allocated(port));
    }

    #[tokio::test]
    async fn test_reassign_stream_url() {
        let f = fixture(fast_config());
        let a = f.registry.create_session(printer("a")).await.unwrap();
        wait_for_state(&f.registry, &a, ConnectionState::Connected).await;
        f.registry.switch_active(&a).await.unwrap();

        let port = f
            .registry
            .reassign_stream_url(&a, "http://a.local/cam2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.registry.get(&a).await.unwrap().camera_port, Some(port));
        assert!(f.streams.keepalive(&a).await.unwrap());
        assert_eq!(f.streams.ports().in_use(), 1);

        assert!(matches!(
            f.registry.reassign_stream_url(&a, "nope").await,
            Err(SessionError::Stream(StreamError::InvalidUrl { .. }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_removes_everything() {
        let f = fixture(fast_config());
        f.registry.create_session(printer("a")).await.unwrap();
        f.registry.create_session(printer("b")).await.unwrap();
        f.registry.shutdown().await;
        assert_eq!(f.registry.count(), 0);
        assert_eq!(f.streams.ports().in_use(), 0);
    }
}
