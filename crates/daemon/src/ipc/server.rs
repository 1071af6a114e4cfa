//! IPC Server for handling CLI and viewer connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and accepts connections. A connection
//! can be used in request/response style, or split into a reader and a
//! writer so responses can be pushed while requests are still being read.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created with mode 0700. A stale socket file at
    /// the path is removed first.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!(path = %path.display(), "IPC socket bound");

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

/// Reading half of a connection: newline-delimited JSON requests.
pub struct RequestReader {
    reader: BufReader<ReadHalf<UnixStream>>,
}

impl RequestReader {
    /// Read the next request. Returns `None` once the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }
}

/// Writing half of a connection.
pub struct ResponseWriter {
    writer: WriteHalf<UnixStream>,
}

impl ResponseWriter {
    /// Send one response line.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// A connection to an IPC client.
pub struct IpcConnection {
    reader: RequestReader,
    writer: ResponseWriter,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: RequestReader {
                reader: BufReader::new(read_half),
            },
            writer: ResponseWriter { writer: write_half },
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        self.reader.read_request().await
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        self.writer.send_response(response).await
    }

    /// Split into independently owned reader and writer halves.
    pub fn into_split(self) -> (RequestReader, ResponseWriter) {
        (self.reader, self.writer)
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
}
