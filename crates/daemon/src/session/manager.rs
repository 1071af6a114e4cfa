//! Session registry and orchestrator.
//!
//! [`SessionManager`] reconciles three views of every session: the live
//! attach channel held in memory, the tmux server's own session table, and
//! the persisted record. It owns session creation with rollback, kill,
//! resize, lazy reconnection of "cold" sessions and startup recovery.
//!
//! Every wired attach channel gets a fresh generation number. Channel
//! callbacks carry the generation they were wired with and are dropped once
//! it is no longer the current one for their session id, so a late exit from
//! a replaced channel can never clobber its successor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use protocol::SessionStatus;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::backlog::Backlog;
use super::command::{validate_workdir, CommandResolver};
use super::error::SessionError;
use super::pty::{AttachChannel, AttachRequest, AttachSpawner, ChannelEvent};
use super::store::SessionStore;
use super::tmux::{Multiplexer, MultiplexerError, RemoteSessionSpec};
use super::types::{default_session_name, CreateSessionRequest, Session, SessionId, SessionPatch};
use crate::config::SessionConfig;

/// Capacity of each session's event broadcast.
const EVENT_CAPACITY: usize = 1024;

/// Capacity of the new-generation notification channel.
const WIRED_CAPACITY: usize = 64;

/// Notification published by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Output chunk with its backlog sequence number.
    Output { seq: u64, data: Bytes },
    Status(SessionStatus),
    Exited(i32),
}

/// A session with a wired attach channel.
pub struct LiveSession {
    id: SessionId,
    generation: u64,
    record: RwLock<Session>,
    channel: Arc<dyn AttachChannel>,
    backlog: StdMutex<Backlog>,
    events: broadcast::Sender<SessionEvent>,
}

impl LiveSession {
    fn new(generation: u64, session: Session, channel: Arc<dyn AttachChannel>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: session.id.clone(),
            generation,
            record: RwLock::new(session),
            channel,
            backlog: StdMutex::new(Backlog::new(capacity)),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> &Arc<dyn AttachChannel> {
        &self.channel
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> Session {
        self.record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.record.read().unwrap_or_else(|e| e.into_inner()).status
    }

    fn update(&self, patch: &SessionPatch) {
        self.record
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .apply(patch);
    }

    /// Appends to the backlog and publishes under one lock, so subscribers
    /// see the same sequence order as the backlog.
    fn push_output(&self, data: Bytes) -> u64 {
        let mut backlog = self.backlog.lock().unwrap_or_else(|e| e.into_inner());
        let seq = backlog.push(data.clone());
        let _ = self.events.send(SessionEvent::Output { seq, data });
        seq
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Backlog snapshot and a receiver positioned right after it.
    pub fn subscribe(&self) -> (Vec<(u64, Bytes)>, broadcast::Receiver<SessionEvent>) {
        let backlog = self.backlog.lock().unwrap_or_else(|e| e.into_inner());
        (backlog.snapshot(), self.events.subscribe())
    }

    /// Backlog snapshot without subscribing.
    pub fn backlog(&self) -> Vec<(u64, Bytes)> {
        self.backlog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    pub fn recent_output(&self, n: usize) -> Vec<Bytes> {
        self.backlog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recent(n)
    }
}

/// Where a session currently lives.
pub enum SessionSlot {
    Live(Arc<LiveSession>),
    /// Known only from its persisted record.
    Cold(Session),
}

impl SessionSlot {
    pub fn session(&self) -> Session {
        match self {
            SessionSlot::Live(live) => live.snapshot(),
            SessionSlot::Cold(record) => record.clone(),
        }
    }
}

/// Held per-id lock. Dropping it forgets the id's mutex once no other
/// caller holds or waits on it.
struct IdGuard<'a> {
    locks: &'a DashMap<SessionId, Arc<Mutex<()>>>,
    id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The session orchestrator. Construct once and share as `Arc<SessionManager>`.
pub struct SessionManager {
    multiplexer: Arc<dyn Multiplexer>,
    spawner: Arc<dyn AttachSpawner>,
    store: Arc<dyn SessionStore>,
    resolver: CommandResolver,
    settings: SessionConfig,
    live: DashMap<SessionId, Arc<LiveSession>>,
    generations: DashMap<SessionId, u64>,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    next_generation: AtomicU64,
    wired: broadcast::Sender<Arc<LiveSession>>,
}

impl SessionManager {
    pub fn new(
        multiplexer: Arc<dyn Multiplexer>,
        spawner: Arc<dyn AttachSpawner>,
        store: Arc<dyn SessionStore>,
        settings: SessionConfig,
    ) -> Self {
        Self {
            resolver: CommandResolver::new(settings.default_shell.clone()),
            multiplexer,
            spawner,
            store,
            settings,
            live: DashMap::new(),
            generations: DashMap::new(),
            locks: DashMap::new(),
            next_generation: AtomicU64::new(0),
            wired: broadcast::channel(WIRED_CAPACITY).0,
        }
    }

    pub fn settings(&self) -> &SessionConfig {
        &self.settings
    }

    /// Number of sessions with a live attach channel.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Serializes mutations of one session id.
    async fn lock_id(&self, id: &str) -> IdGuard<'_> {
        let lock = self.locks.entry(id.to_string()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        IdGuard {
            locks: &self.locks,
            id: id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.generations
            .get(id)
            .map(|current| *current == generation)
            .unwrap_or(false)
    }

    /// Receives every newly wired generation, from create, restart and
    /// reconnection alike.
    pub fn subscribe_wired(&self) -> broadcast::Receiver<Arc<LiveSession>> {
        self.wired.subscribe()
    }

    /// Live handle for `id`, memory only.
    pub fn get_live(&self, id: &str) -> Option<Arc<LiveSession>> {
        self.live.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Live session record, memory only.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.get_live(id).map(|live| live.snapshot())
    }

    /// Every live session, oldest first.
    pub fn get_all(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.live.iter().map(|e| e.value().snapshot()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Every persisted record, including stopped and failed sessions.
    pub async fn history(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.store.select_all().await?)
    }

    /// The last `n` output chunks of a live session; empty when not live.
    pub fn get_recent_output(&self, id: &str, n: usize) -> Vec<Bytes> {
        self.get_live(id)
            .map(|live| live.recent_output(n))
            .unwrap_or_default()
    }

    /// Live handle, or the persisted record when there is none.
    pub async fn slot(&self, id: &str) -> Result<Option<SessionSlot>, SessionError> {
        if let Some(live) = self.get_live(id) {
            return Ok(Some(SessionSlot::Live(live)));
        }
        Ok(self.store.select(id).await?.map(SessionSlot::Cold))
    }

    /// Creates a tmux session, attaches to it and persists the record.
    ///
    /// A caller-supplied id that already has a row updates that row in place.
    /// Any failure after the tmux create is issued kills the remote session
    /// before the error is returned.
    pub async fn create(
        self: &Arc<Self>,
        request: CreateSessionRequest,
    ) -> Result<Session, SessionError> {
        let id_supplied = request.id.is_some();
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let _guard = self.lock_id(&id).await;

        if self.live.contains_key(&id) {
            return Err(SessionError::AlreadyRunning(id));
        }

        let existing = if id_supplied {
            self.store.select(&id).await?
        } else {
            None
        };

        let workdir = validate_workdir(&request.workdir, &self.settings.allowed_workdirs)?;
        let command = self.resolver.resolve(
            request.kind,
            request.command.as_deref(),
            &request.flags,
            &workdir,
        )?;

        if let Some(row) = existing.as_ref().filter(|row| row.is_running()) {
            if self
                .multiplexer
                .has_session(&row.name, &row.channel_address)
                .await?
            {
                return Err(SessionError::AlreadyRunning(id));
            }
        }

        let remote = RemoteSessionSpec {
            name: request
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| default_session_name(request.kind, &id)),
            workdir: workdir.clone(),
            command: command.clone(),
            address: self.multiplexer.channel_address(&id),
            cols: request.cols.unwrap_or(self.settings.default_cols),
            rows: request.rows.unwrap_or(self.settings.default_rows),
        };

        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            name: remote.name.clone(),
            kind: request.kind,
            workdir,
            command,
            flags: request.flags,
            status: SessionStatus::Running,
            pid: None,
            channel_address: remote.address.clone(),
            exit_code: None,
            cols: remote.cols,
            rows: remote.rows,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };

        match self.launch(session, &remote, existing.is_some()).await {
            Ok(session) => Ok(session),
            Err(err) => {
                tracing::warn!(session_id = %id, error = %err, "Session creation failed; rolling back");
                self.rollback(&id, &remote).await;
                Err(err)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        session: Session,
        remote: &RemoteSessionSpec,
        row_exists: bool,
    ) -> Result<Session, SessionError> {
        self.multiplexer.create_session(remote).await?;
        self.verify_visible(remote).await?;

        let live = self.attach(session)?;
        let session = live.snapshot();
        if row_exists {
            self.store
                .update(&session.id, &SessionPatch::replace_with(&session))
                .await?;
        } else {
            self.store.insert(&session).await?;
        }

        tracing::info!(
            session_id = %session.id,
            name = %session.name,
            kind = %session.kind,
            pid = ?session.pid,
            generation = live.generation(),
            "Session created"
        );
        Ok(session)
    }

    /// Polls the session list until the new session shows up.
    async fn verify_visible(&self, remote: &RemoteSessionSpec) -> Result<(), SessionError> {
        let attempts = self.settings.verify_attempts.max(1);
        for attempt in 1..=attempts {
            match self.multiplexer.has_session(&remote.name, &remote.address).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err @ MultiplexerError::Unavailable(_)) => return Err(err.into()),
                Err(err) => {
                    tracing::debug!(name = %remote.name, attempt, error = %err, "Session list not readable yet");
                }
            }
            if attempt < attempts {
                let backoff = self.settings.verify_backoff_ms * u64::from(attempt);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        Err(SessionError::NotVisible(remote.name.clone()))
    }

    async fn rollback(&self, id: &str, remote: &RemoteSessionSpec) {
        self.generations.remove(id);
        if let Some((_, live)) = self.live.remove(id) {
            live.channel.terminate().await;
        }
        if let Err(err) = self
            .multiplexer
            .kill_session(&remote.name, &remote.address)
            .await
        {
            tracing::warn!(session_id = %id, error = %err, "Rollback kill failed");
        }
    }

    /// Spawns an attach channel for `session`, registers it and starts its
    /// event pump.
    fn attach(self: &Arc<Self>, mut session: Session) -> Result<Arc<LiveSession>, SessionError> {
        let command = self
            .multiplexer
            .attach_command(&session.name, &session.channel_address)?;
        let cwd = if session.workdir.is_dir() {
            session.workdir.clone()
        } else {
            std::env::temp_dir()
        };
        let handle = self.spawner.spawn(AttachRequest {
            label: session.name.clone(),
            command,
            cwd,
            cols: session.cols,
            rows: session.rows,
        })?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        session.status = SessionStatus::Running;
        session.pid = handle.channel.pid();
        session.exit_code = None;
        session.updated_at = Utc::now();

        let id = session.id.clone();
        let live = Arc::new(LiveSession::new(
            generation,
            session,
            handle.channel,
            self.settings.backlog_capacity,
        ));
        self.generations.insert(id.clone(), generation);
        self.live.insert(id.clone(), Arc::clone(&live));
        self.spawn_pump(Arc::clone(&live), handle.events);
        let _ = self.wired.send(Arc::clone(&live));

        tracing::debug!(session_id = %id, generation, "Attach channel wired");
        Ok(live)
    }

    fn spawn_pump(
        self: &Arc<Self>,
        live: Arc<LiveSession>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match event {
                    ChannelEvent::Data(data) => {
                        if manager.is_current(&live.id, live.generation) {
                            live.push_output(data);
                        } else {
                            tracing::trace!(session_id = %live.id, generation = live.generation, "Dropping stale output");
                        }
                    }
                    ChannelEvent::Exit(code) => {
                        manager.finalize_exit(&live, code).await;
                        break;
                    }
                }
            }
        });
    }

    async fn finalize_exit(&self, live: &LiveSession, code: i32) {
        let _guard = self.lock_id(&live.id).await;

        if !self.is_current(&live.id, live.generation) {
            tracing::debug!(
                session_id = %live.id,
                generation = live.generation,
                exit_code = code,
                "Ignoring exit from superseded channel"
            );
            return;
        }

        self.generations.remove(&live.id);
        self.live
            .remove_if(&live.id, |_, current| current.generation == live.generation);

        let status = SessionStatus::from_exit_code(code);
        let patch = SessionPatch {
            exit_code: Some(Some(code)),
            pid: Some(None),
            ..SessionPatch::status(status)
        };
        live.update(&patch);
        live.emit(SessionEvent::Exited(code));
        live.emit(SessionEvent::Status(status));

        tracing::info!(session_id = %live.id, exit_code = code, status = %status, "Session exited");
        if let Err(err) = self.store.update(&live.id, &patch).await {
            tracing::warn!(session_id = %live.id, error = %err, "Failed to persist session exit");
        }
    }

    /// Kills a session. Killing an already stopped session succeeds.
    pub async fn kill(&self, id: &str) -> Result<(), SessionError> {
        let _guard = self.lock_id(id).await;

        if let Some((_, live)) = self.live.remove(id) {
            self.generations.remove(id);
            live.channel.terminate().await;

            let session = live.snapshot();
            self.multiplexer
                .kill_session(&session.name, &session.channel_address)
                .await?;

            let patch = SessionPatch::stopped();
            live.update(&patch);
            self.store.update(id, &patch).await?;
            live.emit(SessionEvent::Status(SessionStatus::Stopped));

            tracing::info!(session_id = %id, "Session killed");
            return Ok(());
        }

        match self.store.select(id).await? {
            None => Err(SessionError::NotFound(id.to_string())),
            Some(record) if record.is_running() => {
                self.multiplexer
                    .kill_session(&record.name, &record.channel_address)
                    .await?;
                self.store.update(id, &SessionPatch::stopped()).await?;
                tracing::info!(session_id = %id, "Cold session killed");
                Ok(())
            }
            Some(_) => {
                tracing::debug!(session_id = %id, "Kill of stopped session is a no-op");
                Ok(())
            }
        }
    }

    /// Resizes a session. Resizing a stopped session changes nothing.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        let _guard = self.lock_id(id).await;

        let patch = SessionPatch::dimensions(cols, rows);
        match self.slot(id).await? {
            Some(SessionSlot::Live(live)) => {
                live.channel.resize(cols, rows).await?;
                let session = live.snapshot();
                self.multiplexer
                    .resize_session(&session.name, cols, rows, &session.channel_address)
                    .await?;
                live.update(&patch);
                self.store.update(id, &patch).await?;
            }
            Some(SessionSlot::Cold(record)) if record.is_running() => {
                self.multiplexer
                    .resize_session(&record.name, cols, rows, &record.channel_address)
                    .await?;
                self.store.update(id, &patch).await?;
            }
            Some(SessionSlot::Cold(_)) => return Ok(()),
            None => return Err(SessionError::NotFound(id.to_string())),
        }

        tracing::debug!(session_id = %id, cols, rows, "Session resized");
        Ok(())
    }

    /// Returns the live session, reattaching a cold `running` one on demand.
    ///
    /// `Ok(None)` means the session is unavailable: unknown, not running, or
    /// its tmux session is gone (the row is then marked stopped).
    pub async fn ensure_active_session(
        self: &Arc<Self>,
        id: &str,
    ) -> Result<Option<Session>, SessionError> {
        Ok(self.ensure_live(id).await?.map(|live| live.snapshot()))
    }

    /// Like [`ensure_active_session`](Self::ensure_active_session), returning the live handle.
    pub async fn ensure_live(
        self: &Arc<Self>,
        id: &str,
    ) -> Result<Option<Arc<LiveSession>>, SessionError> {
        if let Some(live) = self.get_live(id) {
            return Ok(Some(live));
        }

        let _guard = self.lock_id(id).await;

        if let Some(live) = self.get_live(id) {
            return Ok(Some(live));
        }
        match self.store.select(id).await? {
            Some(record) if record.is_running() => self.reconnect(record).await,
            _ => Ok(None),
        }
    }

    /// Reattaches to the tmux session behind a persisted `running` row.
    /// Caller holds the id lock.
    async fn reconnect(
        self: &Arc<Self>,
        record: Session,
    ) -> Result<Option<Arc<LiveSession>>, SessionError> {
        if !self
            .multiplexer
            .has_session(&record.name, &record.channel_address)
            .await?
        {
            tracing::info!(session_id = %record.id, name = %record.name, "tmux session gone; marking stopped");
            self.store
                .update(&record.id, &SessionPatch::stopped())
                .await?;
            return Ok(None);
        }

        let live = self.attach(record)?;
        let session = live.snapshot();
        let patch = SessionPatch {
            pid: Some(session.pid),
            exit_code: Some(None),
            ..SessionPatch::status(SessionStatus::Running)
        };
        if let Err(err) = self.store.update(&session.id, &patch).await {
            self.generations.remove(&session.id);
            self.live.remove(&session.id);
            live.channel.terminate().await;
            return Err(err.into());
        }

        tracing::info!(session_id = %session.id, pid = ?session.pid, generation = live.generation(), "Session reattached");
        Ok(Some(live))
    }

    /// Reattaches every persisted `running` session. Sessions that cannot be
    /// recovered are marked stopped; returns how many came back.
    pub async fn load_existing_sessions(self: &Arc<Self>) -> Result<usize, SessionError> {
        let records = self.store.select_all().await?;
        let mut recovered = 0;

        for record in records.into_iter().filter(Session::is_running) {
            let id = record.id.clone();
            let _guard = self.lock_id(&id).await;
            if self.live.contains_key(&id) {
                continue;
            }

            match self.reconnect(record).await {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(session_id = %id, error = %err, "Recovery failed; marking stopped");
                    if let Err(err) = self.store.update(&id, &SessionPatch::stopped()).await {
                        tracing::error!(session_id = %id, error = %err, "Failed to mark session stopped");
                    }
                }
            }
        }

        tracing::info!(recovered, "Startup recovery complete");
        Ok(recovered)
    }

    /// Kills and recreates a session under the same id and launch config.
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<Session, SessionError> {
        let record = self
            .slot(id)
            .await?
            .map(|slot| slot.session())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        self.kill(id).await?;
        tokio::time::sleep(Duration::from_millis(self.settings.restart_delay_ms)).await;

        tracing::info!(session_id = %id, "Restarting session");
        self.create(CreateSessionRequest::from_session(&record)).await
    }

    /// Writes input to a session, reattaching it if needed.
    pub async fn write(self: &Arc<Self>, id: &str, data: &[u8]) -> Result<(), SessionError> {
        match self.ensure_live(id).await? {
            Some(live) => live.channel.write(data).await,
            None => Err(SessionError::NotRunning(id.to_string())),
        }
    }

    /// Record of a session that tmux should currently be hosting.
    async fn running_record(&self, id: &str) -> Result<Session, SessionError> {
        match self.slot(id).await? {
            Some(SessionSlot::Live(live)) => Ok(live.snapshot()),
            Some(SessionSlot::Cold(record)) if record.is_running() => Ok(record),
            Some(SessionSlot::Cold(_)) => Err(SessionError::NotRunning(id.to_string())),
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    /// Plain-text snapshot of the session's pane.
    pub async fn capture(&self, id: &str, history: Option<u32>) -> Result<String, SessionError> {
        let record = self.running_record(id).await?;
        Ok(self
            .multiplexer
            .capture_pane(&record.name, &record.channel_address, history)
            .await?)
    }

    /// Types `text` followed by Enter into the session.
    pub async fn send_keys(&self, id: &str, text: &str) -> Result<(), SessionError> {
        let record = self.running_record(id).await?;
        self.multiplexer
            .send_keys(&record.name, &record.channel_address, text)
            .await?;
        Ok(())
    }

    /// Drops every attach channel without touching tmux or the store, leaving
    /// sessions running for the next daemon to recover.
    pub async fn detach_all(&self) -> usize {
        let ids: Vec<SessionId> = self.live.iter().map(|e| e.key().clone()).collect();
        let mut detached = 0;
        for id in ids {
            self.generations.remove(&id);
            if let Some((_, live)) = self.live.remove(&id) {
                live.channel.terminate().await;
                detached += 1;
            }
        }
        tracing::info!(detached, "Detached from all sessions");
        detached
    }
}
