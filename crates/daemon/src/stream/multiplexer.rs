//! Camera stream fan-out.
//!
//! This module broadcasts upstream camera bytes to every downstream client of
//! one stream session. Slow clients are handled by dropping chunks when their
//! buffers are full, so one stalled viewer never blocks the others.
//!
//! Client sinks are a tagged union: a [`ClientSink::Priority`] entry is pure
//! bookkeeping and has no channel at all, so it can never receive bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use protocol::now_millis;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Unique identifier for a downstream client.
pub type ClientId = String;

/// Default channel capacity for client output.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Type tag of a downstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    /// Keep-alive placeholder held for the active session. Never receives bytes.
    Priority,
    /// The primary UI viewer.
    Visible,
    /// Any other consumer, e.g. a web client.
    Other,
}

/// Statistics about a client's chunk handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Total chunks sent successfully.
    pub chunks_sent: u64,
    /// Chunks dropped due to a slow client.
    pub chunks_dropped: u64,
    /// Whether the client is currently experiencing backpressure.
    pub is_backpressured: bool,
}

/// Output channel of a client that consumes bytes.
///
/// Each handle has a bounded channel. When the channel is full, chunks are
/// dropped rather than blocking other clients.
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Bytes>,
    stats: ClientStats,
}

impl ClientHandle {
    /// Creates a new client handle with a specific channel capacity.
    ///
    /// Returns the handle and a receiver for output data.
    pub fn with_capacity(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ClientHandle {
            id,
            tx,
            stats: ClientStats::default(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    /// Attempts to send a chunk without blocking.
    ///
    /// Returns true if the chunk was queued, false if dropped.
    fn try_send(&mut self, data: Bytes) -> bool {
        match self.tx.try_send(data) {
            Ok(()) => {
                self.stats.chunks_sent += 1;
                if self.stats.is_backpressured {
                    self.stats.is_backpressured = false;
                    tracing::debug!(client_id = %self.id, "Client recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.chunks_dropped += 1;
                if !self.stats.is_backpressured {
                    self.stats.is_backpressured = true;
                    tracing::warn!(
                        client_id = %self.id,
                        dropped = self.stats.chunks_dropped,
                        "Client is backpressured, dropping chunks"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Where a client's bytes go.
pub enum ClientSink {
    Priority,
    Visible(ClientHandle),
    Other(ClientHandle),
}

impl ClientSink {
    pub fn kind(&self) -> ClientKind {
        match self {
            Self::Priority => ClientKind::Priority,
            Self::Visible(_) => ClientKind::Visible,
            Self::Other(_) => ClientKind::Other,
        }
    }

    fn handle(&self) -> Option<&ClientHandle> {
        match self {
            Self::Priority => None,
            Self::Visible(h) | Self::Other(h) => Some(h),
        }
    }

    fn handle_mut(&mut self) -> Option<&mut ClientHandle> {
        match self {
            Self::Priority => None,
            Self::Visible(h) | Self::Other(h) => Some(h),
        }
    }
}

/// A registered downstream client.
pub struct DownstreamClient {
    pub id: ClientId,
    /// Unix milliseconds at registration.
    pub connected_at: u64,
    pub sink: ClientSink,
}

impl DownstreamClient {
    pub fn kind(&self) -> ClientKind {
        self.sink.kind()
    }

    pub fn stats(&self) -> Option<ClientStats> {
        self.sink.handle().map(ClientHandle::stats)
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanoutResult {
    /// Clients that received the chunk.
    pub delivered: usize,
    /// Clients whose receiver is gone.
    pub closed: Vec<ClientId>,
}

/// Client counts of a stream session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCounts {
    pub priority: usize,
    pub visible: usize,
    pub other: usize,
}

impl ClientCounts {
    pub fn total(&self) -> usize {
        self.priority + self.visible + self.other
    }
}

/// The client set of one stream session.
///
/// Cheap to clone; clones share the same set so the upstream pump can
/// broadcast while the stream manager registers and releases clients.
#[derive(Clone)]
pub struct StreamFanout {
    clients: Arc<RwLock<HashMap<ClientId, DownstreamClient>>>,
    last_activity: Arc<AtomicU64>,
    capacity: usize,
}

impl StreamFanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            last_activity: Arc::new(AtomicU64::new(now_millis())),
            capacity,
        }
    }

    /// Registers a client of the given kind.
    ///
    /// Visible and Other clients get a receiver for the fanned-out bytes;
    /// Priority clients get none.
    pub async fn add_client(&self, kind: ClientKind) -> (ClientId, Option<mpsc::Receiver<Bytes>>) {
        let id = Uuid::new_v4().to_string();
        let (sink, rx) = match kind {
            ClientKind::Priority => (ClientSink::Priority, None),
            ClientKind::Visible => {
                let (handle, rx) = ClientHandle::with_capacity(id.clone(), self.capacity);
                (ClientSink::Visible(handle), Some(rx))
            }
            ClientKind::Other => {
                let (handle, rx) = ClientHandle::with_capacity(id.clone(), self.capacity);
                (ClientSink::Other(handle), Some(rx))
            }
        };

        let client = DownstreamClient {
            id: id.clone(),
            connected_at: now_millis(),
            sink,
        };
        self.clients.write().await.insert(id.clone(), client);
        tracing::debug!(client_id = %id, kind = ?kind, "Added stream client");
        (id, rx)
    }

    /// Removes a client, returning its kind if it existed.
    pub async fn remove_client(&self, client_id: &str) -> Option<ClientKind> {
        let removed = self.clients.write().await.remove(client_id);
        removed.map(|c| {
            if let Some(stats) = c.stats() {
                tracing::debug!(
                    client_id = %client_id,
                    sent = stats.chunks_sent,
                    dropped = stats.chunks_dropped,
                    "Removed stream client"
                );
            }
            c.kind()
        })
    }

    /// Removes every client. Receivers observe channel closure.
    pub async fn clear(&self) -> usize {
        let mut clients = self.clients.write().await;
        let n = clients.len();
        clients.clear();
        n
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    pub async fn kind_of(&self, client_id: &str) -> Option<ClientKind> {
        self.clients.read().await.get(client_id).map(|c| c.kind())
    }

    pub async fn counts(&self) -> ClientCounts {
        let clients = self.clients.read().await;
        let mut counts = ClientCounts::default();
        for client in clients.values() {
            match client.kind() {
                ClientKind::Priority => counts.priority += 1,
                ClientKind::Visible => counts.visible += 1,
                ClientKind::Other => counts.other += 1,
            }
        }
        counts
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        self.clients
            .read()
            .await
            .get(client_id)
            .and_then(DownstreamClient::stats)
    }

    /// Returns the last time bytes were broadcast, in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Broadcasts a chunk to every client that has a sink.
    ///
    /// Closed sinks are reported, not removed; whoever owns the client
    /// releases it so the stream session can react to an empty set.
    pub async fn broadcast(&self, data: Bytes) -> FanoutResult {
        self.last_activity.store(now_millis(), Ordering::Relaxed);

        let mut clients = self.clients.write().await;
        let mut result = FanoutResult::default();

        for (client_id, client) in clients.iter_mut() {
            let Some(handle) = client.sink.handle_mut() else {
                continue;
            };
            if handle.is_closed() {
                result.closed.push(client_id.clone());
                continue;
            }
            if handle.try_send(data.clone()) {
                result.delivered += 1;
            }
        }

        result
    }
}
