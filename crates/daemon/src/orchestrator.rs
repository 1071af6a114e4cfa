//! Daemon orchestrator for wiring together all components.
//!
//! `DaemonOrchestrator` is the composition root: it opens the session
//! database, builds the tmux adapter, attach spawner, session manager,
//! forwarder and router, recovers sessions left by a previous daemon, and
//! serves the IPC socket until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ipc::{get_socket_path, pidfile, IpcServer};
use crate::router::Router;
use crate::session::{
    AttachSpawner, Forwarder, Multiplexer, PtySpawner, SessionManager, SessionStore, TmuxAdapter,
};
use crate::storage::SqliteStore;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, recovering sessions.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// Startup recovery finished.
    SessionsRecovered { count: usize },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    manager: Arc<SessionManager>,
    forwarder: Arc<Forwarder>,
    router: Arc<Router>,
    socket_path: PathBuf,
    pid_path: PathBuf,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator backed by tmux, a PTY spawner and the SQLite
    /// session database named in `config`.
    pub fn new(config: Config) -> Result<Self> {
        let database = config.daemon.database_path();
        let store = SqliteStore::open(&database)
            .with_context(|| format!("Failed to open session database: {}", database.display()))?;
        info!(path = %database.display(), "Session database opened");

        let multiplexer = TmuxAdapter::new(
            config.session.socket_dir.clone(),
            config.session.tmux_binary.clone(),
        );

        Ok(Self::with_components(
            config,
            Arc::new(multiplexer),
            Arc::new(PtySpawner::new()),
            Arc::new(store),
        ))
    }

    /// Creates an orchestrator from explicit components.
    pub fn with_components(
        config: Config,
        multiplexer: Arc<dyn Multiplexer>,
        spawner: Arc<dyn AttachSpawner>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let manager = Arc::new(SessionManager::new(
            multiplexer,
            spawner,
            store,
            config.session.clone(),
        ));
        let forwarder = Arc::new(Forwarder::new(Arc::clone(&manager)));
        let shutdown_token = CancellationToken::new();
        let router = Arc::new(Router::new(
            Arc::clone(&manager),
            Arc::clone(&forwarder),
            shutdown_token.clone(),
            config.ipc.viewer_queue,
        ));
        let socket_path = config
            .ipc
            .socket_path
            .clone()
            .unwrap_or_else(get_socket_path);
        let (event_tx, _) = broadcast::channel(64);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            manager,
            forwarder,
            router,
            socket_path,
            pid_path: pidfile::get_pid_file_path(),
            shutdown_token,
            event_tx,
        }
    }

    /// Overrides where the PID file is written.
    pub fn with_pid_path(mut self, path: PathBuf) -> Self {
        self.pid_path = path;
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Recovers persisted sessions, binds the IPC socket and starts serving.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let follower = self.forwarder.follow_generations();
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_token.cancelled().await;
            follower.abort();
        });

        match self.manager.load_existing_sessions().await {
            Ok(count) => self.emit_event(OrchestratorEvent::SessionsRecovered { count }),
            Err(e) => {
                warn!(error = %e, "Session recovery failed");
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("session recovery failed: {}", e),
                });
            }
        }

        let server = match IpcServer::bind(&self.socket_path).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| {
                    format!("Failed to bind IPC socket: {}", self.socket_path.display())
                });
            }
        };
        info!(path = %self.socket_path.display(), "IPC socket listening");

        if let Err(e) = pidfile::write_pid_file(&self.pid_path) {
            warn!(path = %self.pid_path.display(), error = %e, "Failed to write PID file");
        }

        let router = Arc::clone(&self.router);
        let shutdown_token = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            Self::accept_loop(server, router, shutdown_token, event_tx).await;
        });

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn accept_loop(
        server: IpcServer,
        router: Arc<Router>,
        shutdown_token: CancellationToken,
        event_tx: broadcast::Sender<OrchestratorEvent>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("IPC accept loop shutting down");
                    break;
                }
                accepted = server.accept() => match accepted {
                    Ok(connection) => {
                        debug!("IPC connection accepted");
                        tokio::spawn(Arc::clone(&router).serve(connection));
                    }
                    Err(e) => {
                        error!(error = %e, "IPC accept failed");
                        let _ = event_tx.send(OrchestratorEvent::Error {
                            message: format!("IPC accept failed: {}", e),
                        });
                    }
                },
            }
        }
    }

    /// Stops serving and detaches from every session. tmux sessions keep
    /// running so the next daemon can recover them.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();

        let detached = self.manager.detach_all().await;
        debug!(detached, "Attach channels closed");

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), error = %e, "Failed to remove IPC socket");
            }
        }
        pidfile::remove_pid_file(&self.pid_path);

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Returns the shutdown token; cancelled by `stop` or an IPC stop request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{IpcClient, IpcRequest, IpcResponse};
    use crate::session::fake::{FakeMultiplexer, FakeSpawner};
    use crate::session::{CreateSessionRequest, MemoryStore, SessionKind};
    use protocol::SessionStatus;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        tmux: Arc<FakeMultiplexer>,
        spawner: Arc<FakeSpawner>,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                tmux: Arc::new(FakeMultiplexer::new()),
                spawner: Arc::new(FakeSpawner::new()),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            config.daemon.data_dir = self.dir.path().to_path_buf();
            config.session.default_shell = "/bin/sh".to_string();
            config.session.verify_backoff_ms = 1;
            config.ipc.socket_path = Some(self.dir.path().join("run").join("daemon.sock"));
            config
        }

        fn orchestrator(&self) -> DaemonOrchestrator {
            DaemonOrchestrator::with_components(
                self.config(),
                self.tmux.clone(),
                self.spawner.clone(),
                self.store.clone(),
            )
            .with_pid_path(self.dir.path().join("daemon.pid"))
        }
    }

    #[tokio::test]
    async fn test_orchestrator_creation_opens_database() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = dir.path().to_path_buf();

        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(dir.path().join("sessions.db").exists());
    }

    #[tokio::test]
    async fn test_start_serves_ipc_and_stop_cleans_up() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.socket_path().exists());
        assert!(fixture.dir.path().join("daemon.pid").exists());

        let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
        assert!(client.ping().await.unwrap());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(!orchestrator.socket_path().exists());
        assert!(!fixture.dir.path().join("daemon.pid").exists());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                seen.push(state);
            }
        }
        assert_eq!(
            seen,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator();
        orchestrator.start().await.unwrap();
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_detaches_without_killing_tmux() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator();
        orchestrator.start().await.unwrap();

        let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
        let request = CreateSessionRequest::new(SessionKind::Shell, fixture.dir.path());
        let session = match client.create_session(request).await.unwrap() {
            IpcResponse::Session(session) => session,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(session.status, SessionStatus::Running);

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.session_manager().live_count(), 0);
        assert!(fixture
            .tmux
            .remote_exists(&session.name, &session.channel_address));
        assert!(fixture.spawner.last().unwrap().was_terminated());
        assert_eq!(fixture.tmux.call_count("kill"), 0);
    }

    #[tokio::test]
    async fn test_restart_of_daemon_recovers_sessions() {
        let fixture = Fixture::new();
        let mut first = fixture.orchestrator();
        first.start().await.unwrap();
        let request = CreateSessionRequest::new(SessionKind::Shell, fixture.dir.path());
        let session = first.session_manager().create(request).await.unwrap();
        first.stop().await.unwrap();

        let mut second = fixture.orchestrator();
        let mut events = second.subscribe();
        second.start().await.unwrap();

        let recovered = second.session_manager().get(&session.id).unwrap();
        assert_eq!(recovered.status, SessionStatus::Running);
        assert_eq!(fixture.spawner.spawn_count(), 2);

        let mut count = None;
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::SessionsRecovered { count: n } = event {
                count = Some(n);
            }
        }
        assert_eq!(count, Some(1));
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_stop_request_cancels_token() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator();
        orchestrator.start().await.unwrap();
        let token = orchestrator.shutdown_token();

        let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
        assert_eq!(client.send(IpcRequest::Stop).await.unwrap(), IpcResponse::Stopping);
        tokio::time::timeout(std::time::Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_started_daemon_keeps_viewers_across_restart() {
        let fixture = Fixture::new();
        let mut orchestrator = fixture.orchestrator();
        orchestrator.start().await.unwrap();
        let manager = Arc::clone(orchestrator.session_manager());
        let forwarder = Arc::clone(orchestrator.forwarder());

        let request = CreateSessionRequest::new(SessionKind::Shell, fixture.dir.path());
        let session = manager.create(request).await.unwrap();
        let (viewer, mut rx) = forwarder.register_viewer(64);
        forwarder.join(&viewer, &session.id).await;

        manager.restart(&session.id).await.unwrap();
        fixture.spawner.last().unwrap().emit(b"after restart");

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while let Some(message) = rx.recv().await {
                if let protocol::Message::TerminalOutput(out) = message {
                    return out.data == b"after restart";
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(delivered);

        orchestrator.stop().await.unwrap();
    }
}
