//! In-process doubles for the multiplexer and attach channels.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::error::SessionError;
use super::pty::{AttachChannel, AttachCommand, AttachHandle, AttachRequest, AttachSpawner, ChannelEvent};
use super::tmux::{Multiplexer, MultiplexerError, RemoteSession, RemoteSessionSpec};

#[derive(Debug, Default)]
struct FakeState {
    servers: HashMap<PathBuf, Vec<RemoteSession>>,
    calls: Vec<String>,
    hide_created: bool,
    fail_create: Option<String>,
    fail_kill: Option<String>,
    fail_list: Option<String>,
    fail_resize: Option<String>,
}

/// Multiplexer keeping its session table in memory.
#[derive(Debug)]
pub struct FakeMultiplexer {
    socket_dir: PathBuf,
    state: Mutex<FakeState>,
}

impl Default for FakeMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMultiplexer {
    pub fn new() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp/terminal-nexus-fake"),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates succeed but the session never shows up in listings.
    pub fn hide_created(&self, hide: bool) {
        self.state().hide_created = hide;
    }

    pub fn fail_create(&self, stderr: Option<&str>) {
        self.state().fail_create = stderr.map(str::to_string);
    }

    pub fn fail_kill(&self, stderr: Option<&str>) {
        self.state().fail_kill = stderr.map(str::to_string);
    }

    pub fn fail_list(&self, stderr: Option<&str>) {
        self.state().fail_list = stderr.map(str::to_string);
    }

    pub fn fail_resize(&self, stderr: Option<&str>) {
        self.state().fail_resize = stderr.map(str::to_string);
    }

    /// Registers a session as if created outside the daemon.
    pub fn insert_remote(&self, name: &str, address: &Path) {
        self.state()
            .servers
            .entry(address.to_path_buf())
            .or_default()
            .push(remote(name, 80, 24));
    }

    /// Drops a session as if it ended on its own.
    pub fn remove_remote(&self, name: &str, address: &Path) {
        if let Some(sessions) = self.state().servers.get_mut(address) {
            sessions.retain(|s| s.name != name);
        }
    }

    pub fn remote_exists(&self, name: &str, address: &Path) -> bool {
        self.state()
            .servers
            .get(address)
            .map(|s| s.iter().any(|s| s.name == name))
            .unwrap_or(false)
    }

    pub fn remote_size(&self, name: &str, address: &Path) -> Option<(u16, u16)> {
        self.state()
            .servers
            .get(address)?
            .iter()
            .find(|s| s.name == name)
            .map(|s| (s.cols, s.rows))
    }

    /// Total sessions across all fake servers.
    pub fn remote_count(&self) -> usize {
        self.state().servers.values().map(Vec::len).sum()
    }

    /// Recorded calls, formatted as `operation:name`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }
}

fn remote(name: &str, cols: u16, rows: u16) -> RemoteSession {
    RemoteSession {
        id: "$0".to_string(),
        name: name.to_string(),
        created: 0,
        attached: 0,
        cols,
        rows,
    }
}

fn failure(operation: &'static str, stderr: &str) -> MultiplexerError {
    MultiplexerError::CommandFailed {
        operation,
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    fn channel_address(&self, session_id: &str) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", session_id))
    }

    fn attach_command(&self, name: &str, address: &Path) -> Result<AttachCommand, MultiplexerError> {
        Ok(AttachCommand {
            program: PathBuf::from("/fake/tmux"),
            args: vec![
                "-S".to_string(),
                address.to_string_lossy().into_owned(),
                "attach-session".to_string(),
                "-t".to_string(),
                name.to_string(),
            ],
            unset_env: vec![],
        })
    }

    async fn create_session(&self, spec: &RemoteSessionSpec) -> Result<(), MultiplexerError> {
        let mut state = self.state();
        state.calls.push(format!("create:{}", spec.name));
        if let Some(stderr) = state.fail_create.clone() {
            return Err(failure("new-session", &stderr));
        }
        let servers = state.servers.entry(spec.address.clone()).or_default();
        if servers.iter().any(|s| s.name == spec.name) {
            return Err(failure("new-session", &format!("duplicate session: {}", spec.name)));
        }
        if !state.hide_created {
            state
                .servers
                .entry(spec.address.clone())
                .or_default()
                .push(remote(&spec.name, spec.cols, spec.rows));
        }
        Ok(())
    }

    async fn kill_session(&self, name: &str, address: &Path) -> Result<(), MultiplexerError> {
        let mut state = self.state();
        state.calls.push(format!("kill:{}", name));
        if let Some(stderr) = state.fail_kill.clone() {
            return Err(failure("kill-session", &stderr));
        }
        if let Some(sessions) = state.servers.get_mut(address) {
            sessions.retain(|s| s.name != name);
        }
        Ok(())
    }

    async fn list_sessions(&self, address: &Path) -> Result<Vec<RemoteSession>, MultiplexerError> {
        let mut state = self.state();
        state.calls.push(format!("list:{}", address.display()));
        if let Some(stderr) = state.fail_list.clone() {
            return Err(failure("list-sessions", &stderr));
        }
        Ok(state.servers.get(address).cloned().unwrap_or_default())
    }

    async fn resize_session(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        address: &Path,
    ) -> Result<(), MultiplexerError> {
        let mut state = self.state();
        state.calls.push(format!("resize:{}", name));
        if let Some(stderr) = state.fail_resize.clone() {
            return Err(failure("resize-window", &stderr));
        }
        let session = state
            .servers
            .get_mut(address)
            .and_then(|s| s.iter_mut().find(|s| s.name == name))
            .ok_or_else(|| failure("resize-window", &format!("can't find session: {}", name)))?;
        session.cols = cols;
        session.rows = rows;
        Ok(())
    }

    async fn capture_pane(
        &self,
        name: &str,
        _address: &Path,
        history: Option<u32>,
    ) -> Result<String, MultiplexerError> {
        self.state().calls.push(format!("capture:{}", name));
        Ok(format!("pane:{}:{}", name, history.unwrap_or(0)))
    }

    async fn send_keys(
        &self,
        name: &str,
        _address: &Path,
        text: &str,
    ) -> Result<(), MultiplexerError> {
        self.state().calls.push(format!("send-keys:{}:{}", name, text));
        Ok(())
    }
}

/// Channel whose events are produced by the test.
#[derive(Debug)]
pub struct FakeChannel {
    pub label: String,
    pid: u32,
    alive: AtomicBool,
    terminated: AtomicBool,
    echo: bool,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
}

impl FakeChannel {
    /// Emits a chunk of output.
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.events.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(ChannelEvent::Data(Bytes::copy_from_slice(data)));
        }
    }

    /// Emits the exit event and closes the stream.
    pub fn exit(&self, code: i32) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.events.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(ChannelEvent::Exit(code));
        }
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AttachChannel for FakeChannel {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.label.clone()));
        }
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(data.to_vec());
        if self.echo {
            self.emit(data);
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.label.clone()));
        }
        self.resizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((cols, rows));
        Ok(())
    }

    /// Marks the channel dead; the exit event is left to the test.
    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Spawner handing out [`FakeChannel`]s with increasing pids.
#[derive(Debug)]
pub struct FakeSpawner {
    next_pid: AtomicU32,
    echo: bool,
    fail_next: AtomicBool,
    spawned: Mutex<Vec<Arc<FakeChannel>>>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSpawner {
    /// Channels echo writes back as output.
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            echo: true,
            fail_next: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next spawn fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every channel spawned so far, oldest first.
    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.spawned.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The most recently spawned channel.
    pub fn last(&self) -> Option<Arc<FakeChannel>> {
        self.channels().pop()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl AttachSpawner for FakeSpawner {
    fn spawn(&self, request: AttachRequest) -> Result<AttachHandle, SessionError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SessionError::SpawnFailed(format!(
                "{}: injected failure",
                request.label
            )));
        }

        let (tx, events) = mpsc::unbounded_channel();
        let channel = Arc::new(FakeChannel {
            label: request.label,
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            echo: self.echo,
            events: Mutex::new(Some(tx)),
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
        });
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&channel));

        Ok(AttachHandle { channel, events })
    }
}
