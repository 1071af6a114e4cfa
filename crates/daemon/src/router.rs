//! Request router for IPC connections.
//!
//! Control requests go to the [`SessionManager`] and get exactly one
//! [`IpcResponse`]. Forwarding-protocol messages go to the [`Forwarder`];
//! the first one registers the connection as a viewer and starts pushing
//! its outbound queue back over the same socket. Successful create, restart
//! and kill requests are announced to every viewer.

use std::sync::Arc;
use std::time::Instant;

use protocol::messages::{SessionCreated, SessionKilled};
use protocol::{ErrorCode, Message};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipc::{IpcConnection, IpcError, IpcRequest, IpcResponse, ResponseWriter};
use crate::session::{Forwarder, Session, SessionError, SessionManager, ViewerId};

/// Result type for router operations.
pub type RouterResult = Result<IpcResponse, RouterError>;

/// Errors that can occur while handling a request.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Convert the error to an IPC error response.
    pub fn to_response(&self) -> IpcResponse {
        let code = match self {
            RouterError::Session(e) => e.error_code(),
            RouterError::InvalidRequest(_) => ErrorCode::InvalidRequest,
        };
        IpcResponse::error(code, self.to_string())
    }
}

/// Dispatches IPC requests for one daemon.
pub struct Router {
    manager: Arc<SessionManager>,
    forwarder: Arc<Forwarder>,
    shutdown: CancellationToken,
    started: Instant,
    viewer_queue: usize,
}

impl Router {
    pub fn new(
        manager: Arc<SessionManager>,
        forwarder: Arc<Forwarder>,
        shutdown: CancellationToken,
        viewer_queue: usize,
    ) -> Self {
        Self {
            manager,
            forwarder,
            shutdown,
            started: Instant::now(),
            viewer_queue,
        }
    }

    /// Handle one control request.
    pub async fn route(&self, request: IpcRequest) -> RouterResult {
        debug!(?request, "Routing request");

        match request {
            IpcRequest::Ping => Ok(IpcResponse::Pong),
            IpcRequest::Status => Ok(IpcResponse::Status {
                running: !self.shutdown.is_cancelled(),
                uptime_secs: self.started.elapsed().as_secs(),
                session_count: self.manager.live_count(),
                viewer_count: self.forwarder.viewer_count(),
            }),
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                Ok(IpcResponse::Stopping)
            }
            IpcRequest::ListSessions { all } => {
                let sessions = if all {
                    self.manager.history().await?
                } else {
                    self.manager.get_all()
                };
                Ok(IpcResponse::Sessions { sessions })
            }
            IpcRequest::CreateSession(request) => {
                let session = self.manager.create(request).await?;
                self.announce_created(&session);
                Ok(IpcResponse::Session(session))
            }
            IpcRequest::KillSession { session_id } => {
                self.manager.kill(&session_id).await?;
                self.forwarder
                    .broadcast_all(&Message::SessionKilled(SessionKilled {
                        session_id: session_id.clone(),
                    }));
                Ok(IpcResponse::SessionKilled { session_id })
            }
            IpcRequest::ResizeSession {
                session_id,
                cols,
                rows,
            } => {
                if cols == 0 || rows == 0 {
                    return Err(RouterError::InvalidRequest(format!(
                        "terminal size must be non-zero, got {}x{}",
                        cols, rows
                    )));
                }
                self.manager.resize(&session_id, cols, rows).await?;
                self.forwarder.broadcast_resized(&session_id, cols, rows);
                Ok(IpcResponse::SessionResized {
                    session_id,
                    cols,
                    rows,
                })
            }
            IpcRequest::RestartSession { session_id } => {
                let session = self.manager.restart(&session_id).await?;
                self.announce_created(&session);
                Ok(IpcResponse::Session(session))
            }
            IpcRequest::RecentOutput { session_id, chunks } => {
                let n = chunks.unwrap_or(self.manager.settings().replay_chunks);
                let data = self
                    .manager
                    .get_recent_output(&session_id, n)
                    .concat();
                Ok(IpcResponse::Output { session_id, data })
            }
            IpcRequest::Capture { session_id, lines } => {
                let text = self.manager.capture(&session_id, lines).await?;
                Ok(IpcResponse::Capture { session_id, text })
            }
            IpcRequest::SendKeys { session_id, text } => {
                self.manager.send_keys(&session_id, &text).await?;
                Ok(IpcResponse::KeysSent { session_id })
            }
            IpcRequest::Viewer(_) => Err(RouterError::InvalidRequest(
                "viewer messages need a connection".to_string(),
            )),
        }
    }

    fn announce_created(&self, session: &Session) {
        self.forwarder
            .broadcast_all(&Message::SessionCreated(SessionCreated {
                session_id: session.id.clone(),
                name: session.name.clone(),
                session_type: session.kind.as_str().to_string(),
                workdir: session.workdir.to_string_lossy().into_owned(),
                status: session.status,
            }));
    }

    /// Serve one connection until the peer disconnects.
    pub async fn serve(self: Arc<Self>, connection: IpcConnection) {
        let (mut reader, writer) = connection.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let mut viewer: Option<(ViewerId, JoinHandle<()>)> = None;

        loop {
            let request = match reader.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(IpcError::Json(e)) => {
                    debug!(error = %e, "Malformed IPC request");
                    let response = IpcResponse::error(ErrorCode::InvalidRequest, e.to_string());
                    if writer.lock().await.send_response(&response).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "IPC read failed");
                    break;
                }
            };

            match request {
                IpcRequest::Viewer(message) => {
                    let viewer_id = match &viewer {
                        Some((id, _)) => id.clone(),
                        None => {
                            let (id, rx) = self.forwarder.register_viewer(self.viewer_queue);
                            let pump = spawn_viewer_pump(id.clone(), rx, Arc::clone(&writer));
                            viewer = Some((id.clone(), pump));
                            id
                        }
                    };
                    self.forwarder.handle_message(&viewer_id, message).await;
                }
                request => {
                    let stop = matches!(request, IpcRequest::Stop);
                    let response = self
                        .route(request)
                        .await
                        .unwrap_or_else(|e| e.to_response());
                    let sent = writer.lock().await.send_response(&response).await;
                    if stop {
                        self.shutdown.cancel();
                    }
                    if let Err(e) = sent {
                        debug!(error = %e, "IPC write failed");
                        break;
                    }
                }
            }
        }

        if let Some((viewer_id, pump)) = viewer {
            self.forwarder.disconnect(&viewer_id);
            pump.abort();
        }
    }
}

/// Copies a viewer's outbound queue onto its socket.
fn spawn_viewer_pump(
    viewer_id: ViewerId,
    mut rx: mpsc::Receiver<Message>,
    writer: Arc<Mutex<ResponseWriter>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let response = IpcResponse::Viewer(message);
            if let Err(e) = writer.lock().await.send_response(&response).await {
                warn!(viewer_id = %viewer_id, error = %e, "Viewer write failed");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::ipc::{IpcClient, IpcServer};
    use crate::session::fake::{FakeMultiplexer, FakeSpawner};
    use crate::session::{CreateSessionRequest, MemoryStore, SessionKind};
    use protocol::messages::{TerminalInput, TerminalJoin, TerminalOutput, TerminalStatus};
    use protocol::SessionStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        router: Arc<Router>,
        manager: Arc<SessionManager>,
        forwarder: Arc<Forwarder>,
        tmux: Arc<FakeMultiplexer>,
        shutdown: CancellationToken,
        workdir: TempDir,
    }

    fn harness() -> Harness {
        let settings = SessionConfig {
            default_shell: "/bin/sh".to_string(),
            verify_backoff_ms: 1,
            restart_delay_ms: 1,
            ..SessionConfig::default()
        };
        let tmux = Arc::new(FakeMultiplexer::new());
        let manager = Arc::new(SessionManager::new(
            tmux.clone(),
            Arc::new(FakeSpawner::new()),
            Arc::new(MemoryStore::new()),
            settings,
        ));
        let forwarder = Arc::new(Forwarder::new(manager.clone()));
        let shutdown = CancellationToken::new();
        Harness {
            router: Arc::new(Router::new(
                manager.clone(),
                forwarder.clone(),
                shutdown.clone(),
                16,
            )),
            manager,
            forwarder,
            tmux,
            shutdown,
            workdir: TempDir::new().unwrap(),
        }
    }

    impl Harness {
        fn shell(&self) -> IpcRequest {
            IpcRequest::CreateSession(CreateSessionRequest::new(
                SessionKind::Shell,
                self.workdir.path(),
            ))
        }

        async fn create(&self) -> String {
            match self.router.route(self.shell()).await.unwrap() {
                IpcResponse::Session(session) => session.id,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_route_ping_and_status() {
        let h = harness();
        assert_eq!(h.router.route(IpcRequest::Ping).await.unwrap(), IpcResponse::Pong);

        h.create().await;
        match h.router.route(IpcRequest::Status).await.unwrap() {
            IpcResponse::Status {
                running,
                session_count,
                viewer_count,
                ..
            } => {
                assert!(running);
                assert_eq!(session_count, 1);
                assert_eq!(viewer_count, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_create_list_kill() {
        let h = harness();
        let id = h.create().await;

        match h
            .router
            .route(IpcRequest::ListSessions { all: false })
            .await
            .unwrap()
        {
            IpcResponse::Sessions { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].id, id);
                assert_eq!(sessions[0].status, SessionStatus::Running);
            }
            other => panic!("unexpected {:?}", other),
        }

        let killed = h
            .router
            .route(IpcRequest::KillSession {
                session_id: id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(killed, IpcResponse::SessionKilled { session_id: id.clone() });

        match h
            .router
            .route(IpcRequest::ListSessions { all: false })
            .await
            .unwrap()
        {
            IpcResponse::Sessions { sessions } => assert!(sessions.is_empty()),
            other => panic!("unexpected {:?}", other),
        }

        match h
            .router
            .route(IpcRequest::ListSessions { all: true })
            .await
            .unwrap()
        {
            IpcResponse::Sessions { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].status, SessionStatus::Stopped);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_is_announced_to_every_viewer() {
        let h = harness();
        let (_a, mut rx_a) = h.forwarder.register_viewer(16);
        let (_b, mut rx_b) = h.forwarder.register_viewer(16);

        let id = h.create().await;
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                Message::SessionCreated(m) => {
                    assert_eq!(m.session_id, id);
                    assert_eq!(m.session_type, "shell");
                    assert_eq!(
                        std::path::PathBuf::from(&m.workdir),
                        h.manager.get(&id).unwrap().workdir
                    );
                    assert_eq!(m.status, SessionStatus::Running);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        h.router
            .route(IpcRequest::RestartSession {
                session_id: id.clone(),
            })
            .await
            .unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                Message::SessionCreated(m) if m.session_id == id
            ));
        }

        h.router
            .route(IpcRequest::KillSession {
                session_id: id.clone(),
            })
            .await
            .unwrap();
        let killed = Message::SessionKilled(SessionKilled {
            session_id: id.clone(),
        });
        assert_eq!(rx_a.recv().await.unwrap(), killed);
        assert_eq!(rx_b.recv().await.unwrap(), killed);

        assert!(h
            .router
            .route(IpcRequest::KillSession {
                session_id: "missing".to_string(),
            })
            .await
            .is_err());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_errors_carry_codes() {
        let h = harness();

        let err = h
            .router
            .route(IpcRequest::KillSession {
                session_id: "missing".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.to_response(),
            IpcResponse::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));

        let err = h
            .router
            .route(IpcRequest::ResizeSession {
                session_id: "missing".to_string(),
                cols: 0,
                rows: 24,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidRequest(_)));

        h.tmux.fail_create(Some("boom"));
        let err = h.router.route(h.shell()).await.unwrap_err();
        assert!(matches!(
            err.to_response(),
            IpcResponse::Error {
                code: ErrorCode::InternalError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_route_resize_and_recent_output() {
        let h = harness();
        let id = h.create().await;

        let response = h
            .router
            .route(IpcRequest::ResizeSession {
                session_id: id.clone(),
                cols: 132,
                rows: 43,
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            IpcResponse::SessionResized {
                session_id: id.clone(),
                cols: 132,
                rows: 43
            }
        );
        assert_eq!(h.manager.get(&id).map(|s| (s.cols, s.rows)), Some((132, 43)));

        h.manager.write(&id, b"abc").await.unwrap();
        let mut data = Vec::new();
        for _ in 0..50 {
            if let IpcResponse::Output { data: out, .. } = h
                .router
                .route(IpcRequest::RecentOutput {
                    session_id: id.clone(),
                    chunks: None,
                })
                .await
                .unwrap()
            {
                data = out;
            }
            if !data.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(data, b"abc");
    }

    #[tokio::test]
    async fn test_route_capture_and_send_keys() {
        let h = harness();
        let id = h.create().await;
        let name = h.manager.get(&id).unwrap().name;

        let response = h
            .router
            .route(IpcRequest::Capture {
                session_id: id.clone(),
                lines: Some(50),
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            IpcResponse::Capture {
                session_id: id.clone(),
                text: format!("pane:{}:50", name),
            }
        );

        h.router
            .route(IpcRequest::SendKeys {
                session_id: id.clone(),
                text: "make test".to_string(),
            })
            .await
            .unwrap();
        assert!(h
            .tmux
            .calls()
            .contains(&format!("send-keys:{}:make test", name)));
    }

    #[tokio::test]
    async fn test_serve_viewer_over_socket() {
        let h = harness();
        let id = h.create().await;

        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket).await.unwrap();
        let router = h.router.clone();
        tokio::spawn(async move {
            let connection = server.accept().await.unwrap();
            router.serve(connection).await;
        });

        let mut client = IpcClient::connect(&socket).await.unwrap();
        client
            .send_viewer(Message::TerminalJoin(TerminalJoin {
                session_id: id.clone(),
            }))
            .await
            .unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Some(IpcResponse::Viewer(Message::TerminalStatus(TerminalStatus {
                session_id: id.clone(),
                status: SessionStatus::Running,
            })))
        );

        client
            .send_viewer(Message::TerminalInput(TerminalInput {
                session_id: id.clone(),
                data: b"echo hi\r".to_vec(),
            }))
            .await
            .unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Some(IpcResponse::Viewer(Message::TerminalOutput(TerminalOutput {
                session_id: id.clone(),
                data: b"echo hi\r".to_vec(),
            })))
        );

        assert!(client.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_serve_stop_cancels_shutdown() {
        let h = harness();
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket).await.unwrap();
        let router = h.router.clone();
        tokio::spawn(async move {
            let connection = server.accept().await.unwrap();
            router.serve(connection).await;
        });

        let mut client = IpcClient::connect(&socket).await.unwrap();
        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);
        tokio::time::timeout(Duration::from_secs(1), h.shutdown.cancelled())
            .await
            .unwrap();
    }
}
