//! Realtime forwarding of session events to viewers.
//!
//! Each session id has a broadcast group of viewers. A viewer is one
//! transport connection with a bounded outbound queue; it can join many
//! sessions, and join the same session several times (joins are refcounted
//! per connection). Fan-out uses `try_send`, so a slow viewer loses messages
//! instead of stalling the session.
//!
//! One forwarding task exists per wiring of a group to a session generation.
//! Joining replays the session backlog and records the last replayed
//! sequence number; the forwarding task skips anything at or below it, so
//! replay and live output meet without gaps or duplicates. The snapshot and
//! the membership change happen under one group lock, which the forwarding
//! task also holds while delivering.
//!
//! [`Forwarder::follow_generations`] rewires groups that still have members
//! whenever the manager attaches a new generation (restart, recreate or
//! reattach), so viewers keep receiving output without rejoining.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use dashmap::DashMap;
use protocol::messages::{
    Pong, TerminalExited, TerminalOutput, TerminalResized, TerminalStatus,
};
use protocol::{ErrorCode, ErrorMessage, Message, SessionStatus};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::manager::{LiveSession, SessionEvent, SessionManager};

/// Unique identifier for a viewer connection.
pub type ViewerId = String;

/// Delivery statistics for one viewer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub is_backpressured: bool,
}

/// Outbound side of a viewer connection.
struct ViewerHandle {
    id: ViewerId,
    tx: mpsc::Sender<Message>,
    sent: AtomicU64,
    dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl ViewerHandle {
    fn new(id: ViewerId, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            tx,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        };
        (handle, rx)
    }

    /// Queues a message without waiting. Returns false when it was dropped.
    fn try_send(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(viewer_id = %self.id, "Viewer recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(viewer_id = %self.id, dropped, "Viewer is backpressured, dropping messages");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(viewer_id = %self.id, "Viewer channel closed");
                false
            }
        }
    }

    fn stats(&self) -> ViewerStats {
        ViewerStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        }
    }
}

struct Member {
    refs: usize,
    /// Output with a sequence at or below this was already replayed.
    skip_through: u64,
    handle: Arc<ViewerHandle>,
}

#[derive(Default)]
struct Group {
    members: HashMap<ViewerId, Member>,
    /// Generation the forwarding task is subscribed to.
    wired: Option<u64>,
    /// Bumped on every rewire and when the group empties; a forwarding task
    /// only delivers while the epoch it was spawned with is current.
    epoch: u64,
    /// Set once the group is removed from the map; joins must not land here.
    detached: bool,
}

impl Group {
    fn broadcast(&self, message: &Message) {
        for member in self.members.values() {
            member.handle.try_send(message.clone());
        }
    }

    fn unwire(&mut self) {
        self.wired = None;
        self.epoch += 1;
    }
}

/// A fresh subscription to be handed to a forwarding task.
struct Wiring {
    generation: u64,
    epoch: u64,
    rx: broadcast::Receiver<SessionEvent>,
}

type SharedGroup = Arc<Mutex<Group>>;

fn lock(group: &SharedGroup) -> MutexGuard<'_, Group> {
    group.lock().unwrap_or_else(|e| e.into_inner())
}

fn status_message(session_id: &str, status: SessionStatus) -> Message {
    Message::TerminalStatus(TerminalStatus {
        session_id: session_id.to_string(),
        status,
    })
}

fn output_message(session_id: &str, data: &[u8]) -> Message {
    Message::TerminalOutput(TerminalOutput {
        session_id: session_id.to_string(),
        data: data.to_vec(),
    })
}

fn replay_tail(backlog: &[(u64, Bytes)], chunks: usize) -> &[(u64, Bytes)] {
    &backlog[backlog.len().saturating_sub(chunks)..]
}

fn last_seq(backlog: &[(u64, Bytes)]) -> u64 {
    backlog.last().map(|(seq, _)| *seq).unwrap_or(0)
}

/// Join/leave/input/resize front end over the [`SessionManager`].
pub struct Forwarder {
    manager: Arc<SessionManager>,
    replay_chunks: usize,
    viewers: DashMap<ViewerId, Arc<ViewerHandle>>,
    groups: DashMap<String, SharedGroup>,
    memberships: DashMap<ViewerId, HashSet<String>>,
}

impl Forwarder {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let replay_chunks = manager.settings().replay_chunks;
        Self {
            manager,
            replay_chunks,
            viewers: DashMap::new(),
            groups: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    /// Registers a viewer connection and returns its id and message queue.
    pub fn register_viewer(&self, capacity: usize) -> (ViewerId, mpsc::Receiver<Message>) {
        let id = Uuid::new_v4().to_string();
        let (handle, rx) = ViewerHandle::new(id.clone(), capacity);
        self.viewers.insert(id.clone(), Arc::new(handle));
        tracing::debug!(viewer_id = %id, "Viewer registered");
        (id, rx)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn viewer_stats(&self, viewer: &str) -> Option<ViewerStats> {
        self.viewers.get(viewer).map(|h| h.stats())
    }

    /// Number of viewers currently in a session's group.
    pub fn member_count(&self, session_id: &str) -> usize {
        self.groups
            .get(session_id)
            .map(|g| lock(g.value()).members.len())
            .unwrap_or(0)
    }

    fn viewer(&self, viewer: &str) -> Option<Arc<ViewerHandle>> {
        self.viewers.get(viewer).map(|h| Arc::clone(h.value()))
    }

    fn group(&self, session_id: &str) -> SharedGroup {
        self.groups
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn send_to(&self, viewer: &str, message: Message) {
        if let Some(handle) = self.viewer(viewer) {
            handle.try_send(message);
        }
    }

    /// Dispatches one inbound protocol message from a viewer.
    pub async fn handle_message(&self, viewer: &str, message: Message) {
        match message {
            Message::TerminalJoin(m) => self.join(viewer, &m.session_id).await,
            Message::TerminalLeave(m) => self.leave(viewer, &m.session_id),
            Message::TerminalInput(m) => self.input(viewer, &m.session_id, &m.data).await,
            Message::TerminalResize(m) => {
                self.resize(viewer, &m.session_id, m.cols, m.rows).await
            }
            Message::Ping(ping) => self.send_to(
                viewer,
                Message::Pong(Pong {
                    timestamp: ping.timestamp,
                }),
            ),
            other => {
                tracing::debug!(viewer_id = %viewer, message = ?other, "Unexpected message from viewer");
                self.send_to(
                    viewer,
                    Message::Error(ErrorMessage {
                        code: ErrorCode::InvalidRequest,
                        message: "message is not accepted from viewers".to_string(),
                        context: other.session_id().map(str::to_string),
                    }),
                );
            }
        }
    }

    /// Adds a viewer to a session's group, sends the current status and
    /// replays the backlog. An unavailable session yields status `error`.
    pub async fn join(&self, viewer: &str, session_id: &str) {
        let Some(handle) = self.viewer(viewer) else {
            tracing::warn!(viewer_id = %viewer, session_id = %session_id, "Join from unknown viewer");
            return;
        };

        let live = match self.manager.ensure_live(session_id).await {
            Ok(Some(live)) => live,
            Ok(None) => {
                handle.try_send(status_message(session_id, SessionStatus::Error));
                return;
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Join failed to resolve session");
                handle.try_send(status_message(session_id, SessionStatus::Error));
                return;
            }
        };

        let status = status_message(session_id, live.status());
        let (group, wiring, replayed) = loop {
            let group = self.group(session_id);
            let mut g = lock(&group);
            if g.detached {
                continue;
            }

            let (backlog, wiring) = match self.rewire(session_id, &mut g, &live) {
                Some((backlog, wiring)) => (backlog, Some(wiring)),
                None => (live.backlog(), None),
            };
            let replayed = match g.members.get_mut(viewer) {
                Some(member) => {
                    member.refs += 1;
                    // A rewire already sent the status to carried-over members.
                    if wiring.is_none() {
                        handle.try_send(status.clone());
                    }
                    0
                }
                None => {
                    handle.try_send(status.clone());
                    let tail = replay_tail(&backlog, self.replay_chunks);
                    for (_, data) in tail {
                        handle.try_send(output_message(session_id, data));
                    }
                    g.members.insert(
                        viewer.to_string(),
                        Member {
                            refs: 1,
                            skip_through: last_seq(&backlog),
                            handle: Arc::clone(&handle),
                        },
                    );
                    tail.len()
                }
            };
            drop(g);
            break (group, wiring, replayed);
        };

        if let Some(wiring) = wiring {
            spawn_forwarding(session_id.to_string(), group, wiring);
        }
        self.memberships
            .entry(viewer.to_string())
            .or_default()
            .insert(session_id.to_string());
        tracing::debug!(viewer_id = %viewer, session_id = %session_id, replayed, "Viewer joined");
    }

    /// Subscribes the group to `live`'s generation unless it already follows
    /// it. Members carried over from an earlier generation get the new status
    /// and backlog tail. Returns the backlog snapshot taken with the
    /// subscription; the caller spawns the forwarding task once the group
    /// lock is released.
    fn rewire(
        &self,
        session_id: &str,
        g: &mut Group,
        live: &LiveSession,
    ) -> Option<(Vec<(u64, Bytes)>, Wiring)> {
        if g.wired == Some(live.generation()) {
            return None;
        }

        let (backlog, rx) = live.subscribe();
        if !g.members.is_empty() {
            let status = status_message(session_id, live.status());
            let tail = replay_tail(&backlog, self.replay_chunks);
            for member in g.members.values_mut() {
                member.handle.try_send(status.clone());
                for (_, data) in tail {
                    member.handle.try_send(output_message(session_id, data));
                }
                member.skip_through = last_seq(&backlog);
            }
        }
        g.wired = Some(live.generation());
        g.epoch += 1;

        tracing::debug!(session_id = %session_id, generation = live.generation(), members = g.members.len(), "Forwarding wired");
        let wiring = Wiring {
            generation: live.generation(),
            epoch: g.epoch,
            rx,
        };
        Some((backlog, wiring))
    }

    /// Rewires an occupied group to `live`. Empty or removed groups are
    /// left alone; the next join wires them.
    fn wire_group(&self, session_id: &str, group: &SharedGroup, live: &LiveSession) {
        let wiring = {
            let mut g = lock(group);
            if g.detached || g.members.is_empty() {
                return;
            }
            self.rewire(session_id, &mut g, live)
        };
        if let Some((_, wiring)) = wiring {
            spawn_forwarding(session_id.to_string(), Arc::clone(group), wiring);
        }
    }

    /// Rewires the group of `live`'s session if that generation is still
    /// the current one.
    fn follow(&self, live: &LiveSession) {
        let Some(group) = self.groups.get(live.id()).map(|g| Arc::clone(g.value())) else {
            return;
        };
        match self.manager.get_live(live.id()) {
            Some(current) if current.generation() == live.generation() => {
                self.wire_group(live.id(), &group, live);
            }
            _ => {}
        }
    }

    /// Rewires every occupied group to its session's current generation.
    fn follow_all(&self) {
        let groups: Vec<(String, SharedGroup)> = self
            .groups
            .iter()
            .map(|g| (g.key().clone(), Arc::clone(g.value())))
            .collect();
        for (session_id, group) in groups {
            if let Some(live) = self.manager.get_live(&session_id) {
                self.wire_group(&session_id, &group, &live);
            }
        }
    }

    /// Keeps viewer groups attached across generations. Runs until the
    /// forwarder is dropped or the manager goes away.
    pub fn follow_generations(self: &Arc<Self>) -> JoinHandle<()> {
        let mut wired = self.manager.subscribe_wired();
        let forwarder = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = wired.recv().await;
                let Some(forwarder) = forwarder.upgrade() else {
                    break;
                };
                match event {
                    Ok(live) => forwarder.follow(&live),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Generation notices lagged; rewiring all groups");
                        forwarder.follow_all();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Generation follower stopped");
        })
    }

    /// Sends a message to every registered viewer.
    pub fn broadcast_all(&self, message: &Message) {
        for handle in self.viewers.iter() {
            handle.try_send(message.clone());
        }
    }

    /// Drops the group from the map once it has no members.
    fn prune(&self, session_id: &str) {
        self.groups.remove_if(session_id, |_, group| {
            let mut g = lock(group);
            g.detached = g.members.is_empty();
            g.detached
        });
    }

    /// Decrements the viewer's join count; at zero it leaves the group.
    pub fn leave(&self, viewer: &str, session_id: &str) {
        let Some(group) = self.groups.get(session_id).map(|g| Arc::clone(g.value())) else {
            return;
        };

        let left = {
            let mut g = lock(&group);
            let left = match g.members.get(viewer).map(|m| m.refs) {
                Some(refs) if refs > 1 => {
                    if let Some(member) = g.members.get_mut(viewer) {
                        member.refs -= 1;
                    }
                    false
                }
                Some(_) => g.members.remove(viewer).is_some(),
                None => false,
            };
            if g.members.is_empty() {
                g.unwire();
            }
            left
        };

        if left {
            if let Some(mut sessions) = self.memberships.get_mut(viewer) {
                sessions.remove(session_id);
            }
            self.prune(session_id);
            tracing::debug!(viewer_id = %viewer, session_id = %session_id, "Viewer left");
        }
    }

    /// Forwards input to the session; dropped when it is unavailable.
    pub async fn input(&self, viewer: &str, session_id: &str, data: &[u8]) {
        match self.manager.ensure_live(session_id).await {
            Ok(Some(live)) => {
                if let Some(group) = self.groups.get(session_id).map(|g| Arc::clone(g.value())) {
                    self.wire_group(session_id, &group, &live);
                }
                if let Err(err) = live.channel().write(data).await {
                    tracing::debug!(viewer_id = %viewer, session_id = %session_id, error = %err, "Dropping input");
                }
            }
            Ok(None) => {
                tracing::debug!(viewer_id = %viewer, session_id = %session_id, "Dropping input for unavailable session");
            }
            Err(err) => {
                tracing::debug!(viewer_id = %viewer, session_id = %session_id, error = %err, "Dropping input");
            }
        }
    }

    /// Resizes the session; the new size goes to the whole group, a failure
    /// only to the requester.
    pub async fn resize(&self, viewer: &str, session_id: &str, cols: u16, rows: u16) {
        match self.manager.resize(session_id, cols, rows).await {
            Ok(()) => self.broadcast_resized(session_id, cols, rows),
            Err(err) => {
                tracing::debug!(viewer_id = %viewer, session_id = %session_id, error = %err, "Resize failed");
                self.send_to(
                    viewer,
                    Message::Error(ErrorMessage::for_session(
                        err.error_code(),
                        session_id,
                        err.to_string(),
                    )),
                );
            }
        }
    }

    /// Tells every viewer of a session about its new size.
    pub fn broadcast_resized(&self, session_id: &str, cols: u16, rows: u16) {
        let message = Message::TerminalResized(TerminalResized {
            session_id: session_id.to_string(),
            cols,
            rows,
        });
        if let Some(group) = self.groups.get(session_id).map(|g| Arc::clone(g.value())) {
            lock(&group).broadcast(&message);
        }
    }

    /// Removes a viewer from every group. Sessions are not touched.
    pub fn disconnect(&self, viewer: &str) {
        let sessions = self
            .memberships
            .remove(viewer)
            .map(|(_, s)| s)
            .unwrap_or_default();

        for session_id in &sessions {
            if let Some(group) = self.groups.get(session_id).map(|g| Arc::clone(g.value())) {
                let mut g = lock(&group);
                g.members.remove(viewer);
                if g.members.is_empty() {
                    g.unwire();
                }
            }
            self.prune(session_id);
        }

        if let Some((_, handle)) = self.viewers.remove(viewer) {
            let stats = handle.stats();
            tracing::debug!(
                viewer_id = %viewer,
                groups = sessions.len(),
                sent = stats.messages_sent,
                dropped = stats.messages_dropped,
                "Viewer disconnected"
            );
        }
    }
}

/// Fans one generation's events out to the group until the session ends,
/// the group is rewired or emptied, or the event stream closes.
fn spawn_forwarding(session_id: String, group: SharedGroup, wiring: Wiring) {
    let Wiring {
        generation,
        epoch,
        mut rx,
    } = wiring;
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(session_id = %session_id, skipped, "Forwarding lagged; output skipped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let g = lock(&group);
            if g.epoch != epoch {
                break;
            }
            match event {
                SessionEvent::Output { seq, data } => {
                    let message = output_message(&session_id, &data);
                    for member in g.members.values() {
                        if seq > member.skip_through {
                            member.handle.try_send(message.clone());
                        }
                    }
                }
                SessionEvent::Exited(exit_code) => {
                    g.broadcast(&Message::TerminalExited(TerminalExited {
                        session_id: session_id.clone(),
                        exit_code,
                    }));
                }
                SessionEvent::Status(status) => {
                    g.broadcast(&status_message(&session_id, status));
                    if status != SessionStatus::Running {
                        break;
                    }
                }
            }
        }
        tracing::trace!(session_id = %session_id, generation, "Forwarding task finished");
    });
}
