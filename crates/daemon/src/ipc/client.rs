//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! Most calls are request/response. Viewer connections send forwarding
//! messages with [`IpcClient::send_viewer`] and then read pushed responses
//! with [`IpcClient::recv`].

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;
use crate::session::CreateSessionRequest;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

fn timed_out(what: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails when nothing listens on the path, which usually means the daemon
    /// is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, async {
            self.write_request(&request).await?;
            self.read_response().await
        })
        .await
        .map_err(|_| timed_out("operation timed out"))?
    }

    async fn write_request(&mut self, request: &IpcRequest) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<IpcResponse, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Send a forwarding-protocol message without waiting for a reply.
    pub async fn send_viewer(&mut self, message: Message) -> Result<(), IpcError> {
        self.write_request(&IpcRequest::Viewer(message)).await
    }

    /// Wait for the next pushed response, without a timeout.
    ///
    /// Returns `None` once the daemon closes the connection.
    pub async fn recv(&mut self) -> Result<Option<IpcResponse>, IpcError> {
        match self.read_response().await {
            Ok(response) => Ok(Some(response)),
            Err(IpcError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns `true` if the daemon responds with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self, all: bool) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions { all }).await
    }

    pub async fn create_session(
        &mut self,
        request: CreateSessionRequest,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::CreateSession(request)).await
    }

    pub async fn kill_session(&mut self, session_id: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::KillSession { session_id }).await
    }
}
