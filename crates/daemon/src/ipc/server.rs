//! IPC server for handling CLI connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and accepts connections from CLI clients,
//! allowing them to send commands and receive responses.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// Longest accepted request line, in bytes.
const MAX_REQUEST_LEN: u64 = 64 * 1024;

/// A server that listens for IPC connections on a Unix Domain Socket.
///
/// The socket file is removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created as needed and a stale socket file is
    /// replaced. The socket is only accessible by the owning user.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connection to an IPC client.
///
/// Wraps a Unix stream speaking newline-delimited JSON.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected. A line that does not
    /// parse yields [`IpcError::Json`]; the connection stays usable.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = (&mut self.reader)
            .take(MAX_REQUEST_LEN)
            .read_line(&mut line)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && bytes_read as u64 >= MAX_REQUEST_LEN {
            return Err(IpcError::TooLarge);
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request exceeds {MAX_REQUEST_LEN} bytes")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn send_line(stream: &mut UnixStream, line: &str) {
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
        stream.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_bind_creates_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("dir").join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_bind_replaces_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert_eq!(server.path(), socket_path.as_path());
    }

    #[tokio::test]
    async fn test_server_accept_and_communicate() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        let client = tokio::spawn(async move {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            let request = serde_json::to_string(&IpcRequest::Ping).unwrap();
            send_line(&mut stream, &request).await;

            let mut reader = BufReader::new(stream);
            let mut response_line = String::new();
            reader.read_line(&mut response_line).await.unwrap();
            serde_json::from_str::<IpcResponse>(response_line.trim()).unwrap()
        });

        let mut conn = server.accept().await.unwrap();
        assert_eq!(conn.read_request().await.unwrap(), Some(IpcRequest::Ping));
        conn.send_response(&IpcResponse::Pong).await.unwrap();

        assert_eq!(client.await.unwrap(), IpcResponse::Pong);
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        let client = tokio::spawn(async move {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            send_line(&mut stream, "{not json").await;
            send_line(&mut stream, r#""Status""#).await;
            stream
        });

        let mut conn = server.accept().await.unwrap();
        assert!(matches!(conn.read_request().await, Err(IpcError::Json(_))));
        assert_eq!(conn.read_request().await.unwrap(), Some(IpcRequest::Status));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&path).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(conn.read_request().await.unwrap().is_none());
    }
}
