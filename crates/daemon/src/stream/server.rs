//! Downstream TCP server for a stream session.
//!
//! Each stream session listens on its assigned port. A viewer sends an
//! HTTP-style request head; the server answers with a `200 OK` header and
//! then copies the fanned-out camera bytes verbatim until either side closes.

use std::sync::Weak;
use std::time::Duration;

use protocol::SessionId;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::StreamManager;
use super::multiplexer::ClientKind;
use super::StreamError;

/// Maximum size of a request head.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Time allowed for a viewer to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// A running listener.
pub struct ListenerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stops accepting and closes every connection of this listener.
    ///
    /// Does not wait for the accept loop to exit.
    pub fn shutdown(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.handle
    }
}

/// Spawns the accept loop for `session_id`.
pub fn spawn_listener(
    listener: TcpListener,
    session_id: SessionId,
    manager: Weak<StreamManager>,
    content_type: String,
    parent: &CancellationToken,
) -> ListenerHandle {
    let cancel = parent.child_token();
    let task_cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        tracing::debug!(session_id = %session_id, port, "Stream listener started");

        loop {
            let accepted = tokio::select! {
                _ = task_cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(session_id = %session_id, %peer, "Viewer connected");
                    let conn = Connection {
                        session_id: session_id.clone(),
                        manager: manager.clone(),
                        content_type: content_type.clone(),
                        cancel: task_cancel.child_token(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = conn.serve(socket).await {
                            tracing::debug!("Viewer connection ended: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, port, "Accept failed: {}", e);
                }
            }
        }

        tracing::debug!(session_id = %session_id, port, "Stream listener stopped");
    });

    ListenerHandle { cancel, handle }
}

/// Picks the client kind from a request line.
///
/// `GET /stream?client=visible HTTP/1.1` registers a visible client; anything
/// else is an other client.
pub fn client_kind_from_request(request_line: &str) -> ClientKind {
    let target = request_line.split_whitespace().nth(1).unwrap_or("");
    let query = target.split_once('?').map(|(_, q)| q).unwrap_or("");
    let visible = query
        .split('&')
        .any(|pair| pair.eq_ignore_ascii_case("client=visible"));
    if visible {
        ClientKind::Visible
    } else {
        ClientKind::Other
    }
}

/// Builds the response header sent before the stream bytes.
pub fn response_head(content_type: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store\r\nPragma: no-cache\r\nConnection: close\r\n\r\n",
        content_type
    )
}

struct Connection {
    session_id: SessionId,
    manager: Weak<StreamManager>,
    content_type: String,
    cancel: CancellationToken,
}

impl Connection {
    async fn serve(self, socket: TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let request_line = tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut reader))
            .await
            .map_err(|_| anyhow::anyhow!("timed out reading request head"))??;
        let kind = client_kind_from_request(&request_line);

        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        let lease = match manager.request_client(&self.session_id, kind).await {
            Ok(lease) => lease,
            Err(StreamError::NotFound(_)) => {
                write_half
                    .write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n")
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        drop(manager);

        let client_id = lease.id;
        let result = self
            .copy_to_viewer(&mut reader, &mut write_half, lease.receiver)
            .await;

        if let Some(manager) = self.manager.upgrade() {
            match manager.release_client(&self.session_id, &client_id).await {
                Ok(_) | Err(StreamError::ClientNotFound { .. }) | Err(StreamError::NotFound(_)) => {}
                Err(e) => tracing::warn!(client_id = %client_id, "Failed to release viewer: {}", e),
            }
        }
        tracing::debug!(session_id = %self.session_id, client_id = %client_id, "Viewer disconnected");

        result
    }

    async fn copy_to_viewer(
        &self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        receiver: Option<tokio::sync::mpsc::Receiver<bytes::Bytes>>,
    ) -> anyhow::Result<()> {
        let Some(mut receiver) = receiver else {
            return Ok(());
        };

        writer
            .write_all(response_head(&self.content_type).as_bytes())
            .await?;

        let mut scratch = [0u8; 512];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = receiver.recv() => match chunk {
                    Some(data) => writer.write_all(&data).await?,
                    None => break,
                },
                read = reader.read(&mut scratch) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
            }
        }

        let _ = writer.shutdown().await;
        Ok(())
    }
}

/// Reads the request head and returns its first line.
async fn read_head<R>(reader: &mut R) -> anyhow::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut request_line = String::new();
    let mut total = 0usize;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            anyhow::bail!("connection closed before request head");
        }
        total += n;
        if total > MAX_HEAD_BYTES {
            anyhow::bail!("request head too large");
        }
        if request_line.is_empty() {
            request_line = line.trim_end().to_string();
        } else if line.trim_end().is_empty() {
            return Ok(request_line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_kind_from_request() {
        assert_eq!(
            client_kind_from_request("GET /stream?client=visible HTTP/1.1"),
            ClientKind::Visible
        );
        assert_eq!(
            client_kind_from_request("GET /?action=stream&client=visible HTTP/1.1"),
            ClientKind::Visible
        );
        assert_eq!(
            client_kind_from_request("GET /stream HTTP/1.1"),
            ClientKind::Other
        );
        assert_eq!(
            client_kind_from_request("GET /stream?client=web HTTP/1.1"),
            ClientKind::Other
        );
        assert_eq!(client_kind_from_request(""), ClientKind::Other);
    }

    #[test]
    fn test_response_head() {
        let head = response_head("multipart/x-mixed-replace; boundary=frame");
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: multipart/x-mixed-replace; boundary=frame\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_read_head() {
        let data: &[u8] = b"GET /stream?client=visible HTTP/1.1\r\nHost: x\r\n\r\nrest";
        let mut reader = BufReader::new(data);
        let line = read_head(&mut reader).await.unwrap();
        assert_eq!(line, "GET /stream?client=visible HTTP/1.1");
    }

    #[tokio::test]
    async fn test_read_head_truncated() {
        let data: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n";
        let mut reader = BufReader::new(data);
        assert!(read_head(&mut reader).await.is_err());
    }
}
