//! Upstream camera sources and the pump that feeds a stream session.
//!
//! The pump is started when the first client registers and stopped when the
//! last one leaves. While it runs it keeps the upstream open, reconnecting
//! with exponential backoff and reporting [`StreamStatus::Degraded`] when the
//! camera cannot be reached. Downstream clients stay attached throughout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use protocol::{SessionId, StreamStatus};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::multiplexer::{ClientId, StreamFanout};
use super::StreamError;
use crate::backoff::Backoff;

/// A stream of upstream media chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// A source of camera bytes.
pub trait UpstreamSource: Send + Sync {
    /// Opens the upstream at `url`.
    fn open(&self, url: &str) -> BoxFuture<'_, Result<ByteStream, StreamError>>;
}

/// Pulls a camera stream over HTTP.
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(connect_timeout: Duration) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StreamError::UpstreamUnavailable(e.to_string()))?;
        Ok(Self { client })
    }
}

impl UpstreamSource for HttpUpstream {
    fn open(&self, url: &str) -> BoxFuture<'_, Result<ByteStream, StreamError>> {
        let url = url.to_string();
        Box::pin(async move {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| StreamError::UpstreamUnavailable(e.to_string()))?;

            tracing::debug!(url = %url, status = %response.status(), "Opened upstream");

            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| StreamError::UpstreamUnavailable(e.to_string())));
            Ok(stream.boxed())
        })
    }
}

/// In-memory upstream fed by [`MemoryUpstream::push`].
///
/// Every open stream observes the chunks pushed after it was opened.
pub struct MemoryUpstream {
    tx: broadcast::Sender<Bytes>,
    opens: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            opens: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Sends a chunk to every open stream. Returns the number of streams.
    pub fn push(&self, chunk: Bytes) -> usize {
        self.tx.send(chunk).unwrap_or(0)
    }

    /// Makes subsequent opens fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of streams currently open.
    pub fn active_streams(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamSource for MemoryUpstream {
    fn open(&self, url: &str) -> BoxFuture<'_, Result<ByteStream, StreamError>> {
        let url = url.to_string();
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StreamError::UpstreamUnavailable(format!(
                    "{} refused connection",
                    url
                )));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);

            let rx = self.tx.subscribe();
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(chunk) => return Some((Ok(chunk), rx)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        })
    }
}

/// Everything a pump needs to feed one stream session.
pub struct PumpContext {
    pub session_id: SessionId,
    pub url: String,
    pub source: Arc<dyn UpstreamSource>,
    pub fanout: StreamFanout,
    pub status: Arc<watch::Sender<StreamStatus>>,
    pub backoff: Backoff,
    /// Receives clients whose receivers were dropped.
    pub closed_tx: mpsc::UnboundedSender<(SessionId, ClientId)>,
}

/// Handle to a running upstream pump.
pub struct UpstreamPump {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl UpstreamPump {
    /// Spawns the pump task under `parent`.
    pub fn spawn(ctx: PumpContext, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        ctx.status.send_replace(StreamStatus::Starting);
        let handle = tokio::spawn(run_pump(ctx, cancel.clone()));
        Self { cancel, handle }
    }

    /// Cancels the pump and waits for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!("Upstream pump panicked: {}", e);
            }
        }
    }
}

async fn run_pump(mut ctx: PumpContext, cancel: CancellationToken) {
    tracing::debug!(session_id = %ctx.session_id, url = %ctx.url, "Upstream pump started");

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = ctx.source.open(&ctx.url) => opened,
        };

        match opened {
            Ok(mut stream) => {
                ctx.status.send_replace(StreamStatus::Streaming);
                ctx.backoff.reset();
                tracing::info!(session_id = %ctx.session_id, "Upstream connected");

                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!(session_id = %ctx.session_id, "Upstream pump stopped");
                            return;
                        }
                        chunk = stream.next() => chunk,
                    };

                    match chunk {
                        Some(Ok(data)) => {
                            let result = ctx.fanout.broadcast(data).await;
                            for client_id in result.closed {
                                let _ = ctx.closed_tx.send((ctx.session_id.clone(), client_id));
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(session_id = %ctx.session_id, "Upstream error: {}", e);
                            break;
                        }
                        None => {
                            tracing::warn!(session_id = %ctx.session_id, "Upstream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    attempt = ctx.backoff.attempts() + 1,
                    "Failed to open upstream: {}",
                    e
                );
            }
        }

        ctx.status.send_replace(StreamStatus::Degraded);
        let delay = ctx.backoff.next_delay();
        tracing::info!(session_id = %ctx.session_id, "Reconnecting upstream in {:?}", delay);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(session_id = %ctx.session_id, "Upstream pump stopped");
}
