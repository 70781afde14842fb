//! Stream session lifecycle.
//!
//! The [`StreamManager`] owns one [`StreamSession`] per connected device. A
//! stream session holds a camera port and pulls its upstream only while its
//! client set is non-empty; the port goes back to the pool as soon as the
//! last client leaves. The keep-alive flag is represented by a single
//! priority client so the active session's upstream stays open when every
//! viewer has detached.

use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use dashmap::DashMap;
use protocol::{SessionId, StreamStatus};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::multiplexer::{ClientCounts, ClientId, ClientKind, StreamFanout};
use super::ports::PortPool;
use super::server::{spawn_listener, ListenerHandle};
use super::upstream::{PumpContext, UpstreamPump, UpstreamSource};
use super::{validate_stream_url, StreamError};
use crate::backoff::Backoff;
use crate::config::StreamConfig;

/// A registered client and, for byte-consuming kinds, its receiver.
pub struct ClientLease {
    pub id: ClientId,
    pub receiver: Option<mpsc::Receiver<Bytes>>,
}

/// Snapshot of a stream session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub session_id: SessionId,
    pub url: String,
    /// Assigned while the client set is non-empty.
    pub port: Option<u16>,
    pub clients: ClientCounts,
    pub keepalive: bool,
    pub status: StreamStatus,
}

/// Per-session stream state.
pub struct StreamSession {
    session_id: SessionId,
    url: String,
    port: Option<u16>,
    fanout: StreamFanout,
    pump: Option<UpstreamPump>,
    /// Present iff keep-alive is enabled.
    keepalive_client: Option<ClientId>,
    status: Arc<watch::Sender<StreamStatus>>,
    listener: Option<ListenerHandle>,
    cancel: CancellationToken,
}

impl StreamSession {
    pub fn is_streaming(&self) -> bool {
        self.pump.is_some()
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive_client.is_some()
    }
}

/// Manages the stream sessions of every connected device.
pub struct StreamManager {
    sessions: DashMap<SessionId, Arc<Mutex<StreamSession>>>,
    ports: Arc<PortPool>,
    source: Arc<dyn UpstreamSource>,
    config: StreamConfig,
    cancel: CancellationToken,
    closed_tx: mpsc::UnboundedSender<(SessionId, ClientId)>,
    closed_rx: StdMutex<Option<mpsc::UnboundedReceiver<(SessionId, ClientId)>>>,
}

impl StreamManager {
    pub fn new(config: StreamConfig, source: Arc<dyn UpstreamSource>) -> Self {
        let ports = Arc::new(PortPool::new(
            config.port_range_start,
            config.port_range_end,
        ));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            sessions: DashMap::new(),
            ports,
            source,
            config,
            cancel: CancellationToken::new(),
            closed_tx,
            closed_rx: StdMutex::new(Some(closed_rx)),
        }
    }

    /// Starts a background task that releases clients whose receivers were
    /// dropped without an explicit release.
    pub fn start_reaper(self: &Arc<Self>) {
        let rx = self
            .closed_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut rx) = rx else {
            return;
        };

        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let (session_id, client_id) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(entry) => entry,
                        None => break,
                    },
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.release_client(&session_id, &client_id).await.is_ok() {
                    tracing::debug!(
                        session_id = %session_id,
                        client_id = %client_id,
                        "Reaped closed stream client"
                    );
                }
            }
        });
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Registers a stream session for `url`.
    ///
    /// No port is taken until the first client arrives.
    pub async fn open(&self, session_id: &str, url: &str) -> Result<(), StreamError> {
        validate_stream_url(url)?;
        let (status, _) = watch::channel(StreamStatus::Idle);
        let session = StreamSession {
            session_id: session_id.to_string(),
            url: url.to_string(),
            port: None,
            fanout: StreamFanout::new(self.config.channel_capacity),
            pump: None,
            keepalive_client: None,
            status: Arc::new(status),
            listener: None,
            cancel: self.cancel.child_token(),
        };

        match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StreamError::AlreadyOpen(session_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(session)));
            }
        }

        tracing::info!(session_id = %session_id, url = %url, "Opened stream session");
        Ok(())
    }

    /// Closes a stream session, releasing its port.
    ///
    /// Returns false if no stream session existed.
    pub async fn close(&self, session_id: &str) -> Result<bool, StreamError> {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Ok(false);
        };

        let listener = {
            let mut session = session.lock().await;
            if let Some(pump) = session.pump.take() {
                pump.stop().await;
            }
            session.keepalive_client = None;
            let dropped = session.fanout.clear().await;
            session.status.send_replace(StreamStatus::Idle);
            session.cancel.cancel();
            tracing::info!(
                session_id = %session_id,
                port = ?session.port,
                clients = dropped,
                "Closed stream session"
            );
            self.detach_port(&mut session)
        };

        if let Some(listener) = listener {
            let _ = listener.await;
        }
        Ok(true)
    }

    /// Closes every stream session.
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!(session_id = %id, "Failed to close stream session: {}", e);
            }
        }
    }

    /// Registers a client, starting the upstream if it is not running.
    ///
    /// The first client takes a camera port for the session. A priority
    /// request while keep-alive is already on returns the existing priority
    /// client.
    pub async fn request_client(
        self: &Arc<Self>,
        session_id: &str,
        kind: ClientKind,
    ) -> Result<ClientLease, StreamError> {
        let session = self.get(session_id)?;
        let mut session = session.lock().await;

        let lease = if kind == ClientKind::Priority {
            if let Some(id) = &session.keepalive_client {
                return Ok(ClientLease {
                    id: id.clone(),
                    receiver: None,
                });
            }
            self.attach_port(&mut session).await?;
            let (id, _) = session.fanout.add_client(ClientKind::Priority).await;
            session.keepalive_client = Some(id.clone());
            ClientLease { id, receiver: None }
        } else {
            self.attach_port(&mut session).await?;
            let (id, receiver) = session.fanout.add_client(kind).await;
            ClientLease { id, receiver }
        };

        self.ensure_pump(&mut session);
        tracing::debug!(
            session_id = %session_id,
            client_id = %lease.id,
            kind = ?kind,
            "Stream client registered"
        );
        Ok(lease)
    }

    /// Removes a client. When none remain the upstream stops and the port is
    /// released.
    pub async fn release_client(
        &self,
        session_id: &str,
        client_id: &str,
    ) -> Result<ClientKind, StreamError> {
        let session = self.get(session_id)?;
        let mut session = session.lock().await;

        let kind = session
            .fanout
            .remove_client(client_id)
            .await
            .ok_or_else(|| StreamError::ClientNotFound {
                session_id: session_id.to_string(),
                client_id: client_id.to_string(),
            })?;

        if session.keepalive_client.as_deref() == Some(client_id) {
            session.keepalive_client = None;
        }
        self.stop_if_idle(&mut session).await;
        Ok(kind)
    }

    /// Enables or disables keep-alive for a stream session.
    ///
    /// Returns the session's camera port afterwards, if it holds one.
    pub async fn set_keepalive(
        self: &Arc<Self>,
        session_id: &str,
        enabled: bool,
    ) -> Result<Option<u16>, StreamError> {
        let session = self.get(session_id)?;
        let mut session = session.lock().await;
        self.apply_keepalive(&mut session, enabled).await?;
        Ok(session.port)
    }

    /// Points a stream session at a new upstream URL.
    ///
    /// Existing clients are disconnected and the old port is released. When
    /// keep-alive was on it is reapplied, which takes a fresh port; that port
    /// is returned.
    pub async fn reassign_stream_url(
        self: &Arc<Self>,
        session_id: &str,
        url: &str,
    ) -> Result<Option<u16>, StreamError> {
        validate_stream_url(url)?;
        let session = self.get(session_id)?;
        let mut session = session.lock().await;

        let keepalive = session.keepalive();
        if let Some(pump) = session.pump.take() {
            pump.stop().await;
        }
        session.keepalive_client = None;
        session.fanout.clear().await;
        session.status.send_replace(StreamStatus::Idle);
        let old_port = session.port;
        drop(self.detach_port(&mut session));

        session.url = url.to_string();
        if keepalive {
            if let Err(e) = self.apply_keepalive(&mut session, true).await {
                tracing::error!(session_id = %session_id, "Keep-alive lost on reassign: {}", e);
                return Err(e);
            }
        }

        tracing::info!(
            session_id = %session_id,
            old_port = ?old_port,
            port = ?session.port,
            url = %url,
            "Reassigned stream url"
        );
        Ok(session.port)
    }

    pub async fn status(&self, session_id: &str) -> Result<StreamStatus, StreamError> {
        let session = self.get(session_id)?;
        let status = *session.lock().await.status.borrow();
        Ok(status)
    }

    /// Subscribes to status changes of a stream session.
    pub async fn subscribe_status(
        &self,
        session_id: &str,
    ) -> Result<watch::Receiver<StreamStatus>, StreamError> {
        let session = self.get(session_id)?;
        let session = session.lock().await;
        Ok(session.status.subscribe())
    }

    pub async fn info(&self, session_id: &str) -> Result<StreamInfo, StreamError> {
        let session = self.get(session_id)?;
        let session = session.lock().await;
        let clients = session.fanout.counts().await;
        let status = *session.status.borrow();
        Ok(StreamInfo {
            session_id: session.session_id.clone(),
            url: session.url.clone(),
            port: session.port,
            clients,
            keepalive: session.keepalive(),
            status,
        })
    }

    /// Returns the camera port, if the session currently holds one.
    pub async fn port(&self, session_id: &str) -> Result<Option<u16>, StreamError> {
        let session = self.get(session_id)?;
        let port = session.lock().await.port;
        Ok(port)
    }

    pub async fn is_streaming(&self, session_id: &str) -> Result<bool, StreamError> {
        let session = self.get(session_id)?;
        let streaming = session.lock().await.is_streaming();
        Ok(streaming)
    }

    pub async fn keepalive(&self, session_id: &str) -> Result<bool, StreamError> {
        let session = self.get(session_id)?;
        let keepalive = session.lock().await.keepalive();
        Ok(keepalive)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Stops every stream session and background task.
    pub async fn shutdown(&self) {
        self.close_all().await;
        self.cancel.cancel();
    }

    fn get(&self, session_id: &str) -> Result<Arc<Mutex<StreamSession>>, StreamError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StreamError::NotFound(session_id.to_string()))
    }

    fn ensure_pump(&self, session: &mut StreamSession) {
        if session.pump.is_some() {
            return;
        }
        let ctx = PumpContext {
            session_id: session.session_id.clone(),
            url: session.url.clone(),
            source: Arc::clone(&self.source),
            fanout: session.fanout.clone(),
            status: Arc::clone(&session.status),
            backoff: Backoff::new(self.config.initial_backoff(), self.config.max_backoff())
                .with_multiplier(self.config.backoff_multiplier),
            closed_tx: self.closed_tx.clone(),
        };
        session.pump = Some(UpstreamPump::spawn(ctx, &session.cancel));
        tracing::info!(session_id = %session.session_id, "Stream started");
    }

    async fn stop_if_idle(&self, session: &mut StreamSession) {
        if !session.fanout.is_empty().await {
            return;
        }
        if let Some(pump) = session.pump.take() {
            pump.stop().await;
            session.status.send_replace(StreamStatus::Idle);
            tracing::info!(session_id = %session.session_id, "Stream stopped, no clients left");
        }
        // Viewer tasks release through here, so the listener is not awaited.
        drop(self.detach_port(session));
    }

    async fn apply_keepalive(
        self: &Arc<Self>,
        session: &mut StreamSession,
        enabled: bool,
    ) -> Result<(), StreamError> {
        match (enabled, session.keepalive_client.clone()) {
            (true, None) => {
                self.attach_port(session).await?;
                let (id, _) = session.fanout.add_client(ClientKind::Priority).await;
                session.keepalive_client = Some(id);
                self.ensure_pump(session);
                tracing::debug!(session_id = %session.session_id, "Keep-alive enabled");
            }
            (false, Some(id)) => {
                session.fanout.remove_client(&id).await;
                session.keepalive_client = None;
                self.stop_if_idle(session).await;
                tracing::debug!(session_id = %session.session_id, "Keep-alive disabled");
            }
            _ => {}
        }
        Ok(())
    }

    /// Takes a camera port for the session unless it already holds one.
    async fn attach_port(self: &Arc<Self>, session: &mut StreamSession) -> Result<u16, StreamError> {
        if let Some(port) = session.port {
            return Ok(port);
        }
        // Closed while the caller waited for the lock.
        if session.cancel.is_cancelled() {
            return Err(StreamError::NotFound(session.session_id.clone()));
        }
        let (port, listener) = self.bind_port(&session.session_id, &session.cancel).await?;
        session.port = Some(port);
        session.listener = listener;
        tracing::debug!(session_id = %session.session_id, port, "Assigned camera port");
        Ok(port)
    }

    /// Gives the session's port back to the pool and stops its listener.
    ///
    /// Returns the listener task so callers outside a viewer task can wait
    /// for it.
    fn detach_port(&self, session: &mut StreamSession) -> Option<JoinHandle<()>> {
        let listener = session.listener.take().map(ListenerHandle::shutdown);
        if let Some(port) = session.port.take() {
            self.release_port(&session.session_id, port);
        }
        listener
    }

    /// Allocates a port and, when serving downstream, binds its listener.
    ///
    /// Ports held by other processes are skipped.
    async fn bind_port(
        self: &Arc<Self>,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(u16, Option<ListenerHandle>), StreamError> {
        if !self.config.serve_downstream {
            return Ok((self.ports.allocate()?, None));
        }

        let mut skipped: Vec<u16> = Vec::new();
        let mut last_error: Option<StreamError> = None;
        loop {
            let port = match self.ports.allocate_excluding(&skipped) {
                Ok(port) => port,
                Err(e) => return Err(last_error.unwrap_or_else(|| e.into())),
            };

            match TcpListener::bind((self.config.bind_address.as_str(), port)).await {
                Ok(listener) => {
                    let handle = spawn_listener(
                        listener,
                        session_id.to_string(),
                        Arc::downgrade(self),
                        self.config.content_type.clone(),
                        cancel,
                    );
                    return Ok((port, Some(handle)));
                }
                Err(source) => {
                    tracing::warn!(port, "Camera port unavailable, trying next: {}", source);
                    self.release_port(session_id, port);
                    skipped.push(port);
                    last_error = Some(StreamError::Bind { port, source });
                }
            }
        }
    }

    fn release_port(&self, session_id: &str, port: u16) {
        if let Err(e) = self.ports.release(port) {
            tracing::warn!(session_id = %session_id, "Ignoring port release: {}", e);
        }
    }
}
