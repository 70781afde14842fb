//! Hub orchestrator wiring together all daemon components.
//!
//! The [`HubOrchestrator`] builds the stream manager and session registry
//! from configuration, relays their events, and answers administrative
//! requests arriving over the IPC socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use protocol::{NotificationSettings, RegistryEvent, SessionEvent};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::{DeviceConnector, HttpStatusConnector};
use crate::ipc::{ErrorKind, IpcConnection, IpcError, IpcRequest, IpcResponse, IpcServer};
use crate::monitor::{
    HttpUsageLedger, LoggingLedger, NotificationSink, TracingSink, UsageLedger,
};
use crate::session::{RegistryDeps, SessionRegistry};
use crate::stream::{HttpUpstream, StreamManager, UpstreamSource};

/// Timeout for establishing upstream camera connections.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for usage deduction requests.
const LEDGER_TIMEOUT: Duration = Duration::from_secs(10);

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A session was created, removed, switched or changed connection state.
    Registry(RegistryEvent),
    /// A job lifecycle or cooled event from any session.
    Session(SessionEvent),
}

/// External collaborators of the hub.
pub struct HubComponents {
    pub connector: Arc<dyn DeviceConnector>,
    pub upstream: Arc<dyn UpstreamSource>,
    pub ledger: Arc<dyn UsageLedger>,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
}

impl HubComponents {
    /// Builds the HTTP-backed components described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let connector = HttpStatusConnector::new(config.device.clone())
            .context("Failed to build device connector")?;
        let upstream =
            HttpUpstream::new(UPSTREAM_CONNECT_TIMEOUT).context("Failed to build upstream client")?;

        let ledger: Arc<dyn UsageLedger> = match &config.usage.deduction_url {
            Some(url) => Arc::new(
                HttpUsageLedger::new(url.clone(), LEDGER_TIMEOUT)
                    .context("Failed to build usage ledger")?,
            ),
            None => Arc::new(LoggingLedger),
        };

        Ok(Self {
            connector: Arc::new(connector),
            upstream: Arc::new(upstream),
            ledger,
            sinks: vec![Arc::new(TracingSink)],
        })
    }
}

/// Cheap handle answering IPC requests.
#[derive(Clone)]
pub struct HubHandle {
    registry: Arc<SessionRegistry>,
    settings: Arc<watch::Sender<NotificationSettings>>,
    shutdown_token: CancellationToken,
    started_at: Instant,
}

impl HubHandle {
    /// Executes one administrative request.
    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        debug!(request = ?request, "IPC request");
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: !self.shutdown_token.is_cancelled(),
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.registry.count(),
                active_session: self.registry.active(),
                ports_in_use: self.registry.streams().ports().in_use(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.shutdown_token.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.registry.list().await,
            },
            IpcRequest::CreateSession { identity } => {
                match self.registry.create_session(identity).await {
                    Ok(session_id) => IpcResponse::SessionCreated { session_id },
                    Err(e) => e.into(),
                }
            }
            IpcRequest::SwitchActive { session_id } => {
                match self.registry.switch_active(&session_id).await {
                    Ok(previous) => IpcResponse::Switched {
                        previous,
                        current: session_id,
                    },
                    Err(e) => e.into(),
                }
            }
            IpcRequest::RemoveSession { session_id } => {
                match self.registry.remove_session(&session_id).await {
                    Ok(report) => IpcResponse::SessionRemoved {
                        session_id,
                        error: report.first_error,
                    },
                    Err(e) => e.into(),
                }
            }
            IpcRequest::SetKeepalive {
                session_id,
                enabled,
            } => match self.registry.set_keepalive(&session_id, enabled).await {
                Ok(port) => IpcResponse::KeepaliveSet {
                    session_id,
                    enabled,
                    port,
                },
                Err(e) => e.into(),
            },
            IpcRequest::ReassignStreamUrl { session_id, url } => {
                match self.registry.reassign_stream_url(&session_id, &url).await {
                    Ok(port) => IpcResponse::StreamReassigned { session_id, port },
                    Err(e) => e.into(),
                }
            }
            IpcRequest::UpdateNotificationSettings { settings } => {
                self.settings.send_replace(settings);
                info!(
                    enabled = settings.enabled,
                    on_print_complete = settings.on_print_complete,
                    on_cooled = settings.on_cooled,
                    "Notification settings updated"
                );
                IpcResponse::SettingsUpdated { settings }
            }
        }
    }

    /// Answers requests on one connection until it closes or the hub stops.
    pub async fn serve_connection(&self, mut conn: IpcConnection) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => break,
                request = conn.read_request() => request,
            };

            let response = match request {
                Ok(Some(request)) => self.handle(request).await,
                Ok(None) => break,
                Err(IpcError::Json(e)) => {
                    IpcResponse::error(ErrorKind::InvalidRequest, format!("malformed request: {}", e))
                }
                Err(IpcError::TooLarge) => {
                    let response = IpcResponse::error(ErrorKind::InvalidRequest, "request too large");
                    let _ = conn.send_response(&response).await;
                    break;
                }
                Err(e) => {
                    debug!("IPC connection closed: {}", e);
                    break;
                }
            };

            if let Err(e) = conn.send_response(&response).await {
                debug!("Failed to send IPC response: {}", e);
                break;
            }
        }
    }
}

/// Orchestrator managing all hub subsystems.
pub struct HubOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    settings: Arc<watch::Sender<NotificationSettings>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    started_at: Instant,
    tasks: Vec<JoinHandle<()>>,
}

impl HubOrchestrator {
    /// Creates an orchestrator talking to real devices over HTTP.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let components = HubComponents::from_config(&config)?;
        Ok(Self::with_components(config, components))
    }

    /// Creates an orchestrator from explicit components.
    pub fn with_components(config: Config, components: HubComponents) -> Self {
        let (settings_tx, settings_rx) = watch::channel(config.notifications);
        let streams = Arc::new(StreamManager::new(config.stream.clone(), components.upstream));
        let registry = Arc::new(SessionRegistry::new(
            config.session.clone(),
            config.cooldown.clone(),
            RegistryDeps {
                connector: components.connector,
                streams,
                ledger: components.ledger,
                sinks: components.sinks,
                settings: settings_rx,
            },
        ));
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            settings: Arc::new(settings_tx),
            shutdown_token: CancellationToken::new(),
            event_tx,
            started_at: Instant::now(),
            tasks: Vec::new(),
        }
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts background tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!(
            max_sessions = self.config.session.max_sessions,
            ports = ?self.registry.streams().ports().range(),
            "Starting hub orchestrator"
        );

        self.registry.streams().start_reaper();
        self.started_at = Instant::now();

        let relay = tokio::spawn(relay_events(
            self.registry.subscribe(),
            self.registry.subscribe_lifecycle(),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        ));
        self.tasks.push(relay);

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Hub orchestrator started");
        Ok(())
    }

    /// Accepts IPC connections until shutdown.
    pub fn serve_ipc(&mut self, server: IpcServer) {
        let handle = self.handle();
        let token = self.shutdown_token.clone();
        info!(path = %server.path().display(), "IPC server listening");

        let task = tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    accepted = server.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Failed to accept IPC connection: {}", e);
                            continue;
                        }
                    },
                };
                let handle = handle.clone();
                tokio::spawn(async move { handle.serve_connection(conn).await });
            }
            debug!("IPC server stopped");
        });
        self.tasks.push(task);
    }

    /// Stops everything, removing every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::ShuttingDown));
        info!("Stopping hub orchestrator...");

        self.shutdown_token.cancel();
        self.registry.shutdown().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Background task panicked: {}", e);
                }
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Hub orchestrator stopped");
        Ok(())
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            registry: Arc::clone(&self.registry),
            settings: Arc::clone(&self.settings),
            shutdown_token: self.shutdown_token.clone(),
            started_at: self.started_at,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> watch::Receiver<NotificationSettings> {
        self.settings.subscribe()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn relay_events(
    mut registry: broadcast::Receiver<RegistryEvent>,
    mut sessions: broadcast::Receiver<SessionEvent>,
    out: broadcast::Sender<OrchestratorEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = registry.recv() => match event {
                Ok(event) => {
                    info!(event = ?event, "Registry");
                    OrchestratorEvent::Registry(event)
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Registry event relay lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = sessions.recv() => match event {
                Ok(event) => OrchestratorEvent::Session(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Session event relay lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        let _ = out.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceIdentity, ManualConnector};
    use crate::ipc::IpcClient;
    use crate::monitor::MemoryLedger;
    use crate::stream::MemoryUpstream;
    use tempfile::TempDir;

    fn test_orchestrator() -> HubOrchestrator {
        let mut config = Config::default();
        config.stream.serve_downstream = false;
        config.session.reconnect_initial_ms = 10;
        config.session.reconnect_max_ms = 50;

        HubOrchestrator::with_components(
            config,
            HubComponents {
                connector: Arc::new(ManualConnector::new()),
                upstream: Arc::new(MemoryUpstream::new()),
                ledger: Arc::new(MemoryLedger::new()),
                sinks: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_orchestrator_state_transitions() {
        let mut orchestrator = test_orchestrator();
        let mut events = orchestrator.subscribe();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_handle_session_requests() {
        let mut orchestrator = test_orchestrator();
        orchestrator.start().await.unwrap();
        let handle = orchestrator.handle();

        let response = handle
            .handle(IpcRequest::CreateSession {
                identity: DeviceIdentity::new("P1", "p1.local"),
            })
            .await;
        let IpcResponse::SessionCreated { session_id } = response else {
            panic!("Expected SessionCreated, got {:?}", response);
        };

        let response = handle
            .handle(IpcRequest::SwitchActive {
                session_id: session_id.clone(),
            })
            .await;
        assert_eq!(
            response,
            IpcResponse::Switched {
                previous: None,
                current: session_id.clone()
            }
        );

        match handle.handle(IpcRequest::Status).await {
            IpcResponse::Status {
                running,
                session_count,
                active_session,
                ..
            } => {
                assert!(running);
                assert_eq!(session_count, 1);
                assert_eq!(active_session, Some(session_id.clone()));
            }
            other => panic!("Expected Status, got {:?}", other),
        }

        let response = handle
            .handle(IpcRequest::RemoveSession {
                session_id: session_id.clone(),
            })
            .await;
        assert_eq!(
            response,
            IpcResponse::SessionRemoved {
                session_id: session_id.clone(),
                error: None
            }
        );

        match handle.handle(IpcRequest::SwitchActive { session_id }).await {
            IpcResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
            other => panic!("Expected Error, got {:?}", other),
        }

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_identity_is_invalid_request() {
        let orchestrator = test_orchestrator();
        let response = orchestrator
            .handle()
            .handle(IpcRequest::CreateSession {
                identity: DeviceIdentity::new("", "p1.local"),
            })
            .await;
        assert!(matches!(
            response,
            IpcResponse::Error {
                kind: ErrorKind::InvalidRequest,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_update_notification_settings() {
        let orchestrator = test_orchestrator();
        let mut settings = orchestrator.settings();
        let update = NotificationSettings {
            enabled: true,
            on_print_complete: true,
            on_cooled: false,
        };

        let response = orchestrator
            .handle()
            .handle(IpcRequest::UpdateNotificationSettings { settings: update })
            .await;
        assert_eq!(response, IpcResponse::SettingsUpdated { settings: update });
        assert!(settings.has_changed().unwrap());
        assert_eq!(*settings.borrow_and_update(), update);
    }

    #[tokio::test]
    async fn test_ipc_roundtrip_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");

        let mut orchestrator = test_orchestrator();
        orchestrator.start().await.unwrap();
        orchestrator.serve_ipc(IpcServer::bind(&socket_path).await.unwrap());
        let shutdown = orchestrator.shutdown_token();

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());
        assert_eq!(
            client.list_sessions().await.unwrap(),
            IpcResponse::Sessions {
                sessions: Vec::new()
            }
        );
        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);

        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .unwrap();
        orchestrator.stop().await.unwrap();
        assert!(!socket_path.exists());
    }
}
