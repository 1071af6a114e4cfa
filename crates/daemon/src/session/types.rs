//! Session entity and request types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use protocol::SessionStatus;
use serde::{Deserialize, Serialize};

/// Unique identifier for a session.
pub type SessionId = String;

/// Kind of program a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Claude Code agent.
    Claude,
    /// Factory Droid agent.
    Droid,
    /// Plain shell, or an arbitrary command.
    Shell,
}

impl SessionKind {
    /// Lowercase name, used in generated session names and the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Claude => "claude",
            SessionKind::Droid => "droid",
            SessionKind::Shell => "shell",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown session kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown session type: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for SessionKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(SessionKind::Claude),
            "droid" => Ok(SessionKind::Droid),
            "shell" => Ok(SessionKind::Shell),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A terminal session, live or persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// tmux session name.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub workdir: PathBuf,
    /// Launch command, resolved once at creation.
    pub command: String,
    pub flags: Vec<String>,
    pub status: SessionStatus,
    /// Attach process id while running.
    pub pid: Option<u32>,
    /// Private tmux control socket owning this session.
    pub channel_address: PathBuf,
    pub exit_code: Option<i32>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session is marked running.
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Applies a partial update in place.
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(workdir) = &patch.workdir {
            self.workdir = workdir.clone();
        }
        if let Some(command) = &patch.command {
            self.command = command.clone();
        }
        if let Some(flags) = &patch.flags {
            self.flags = flags.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(pid) = patch.pid {
            self.pid = pid;
        }
        if let Some(address) = &patch.channel_address {
            self.channel_address = address.clone();
        }
        if let Some(exit_code) = patch.exit_code {
            self.exit_code = exit_code;
        }
        if let Some(cols) = patch.cols {
            self.cols = cols;
        }
        if let Some(rows) = patch.rows {
            self.rows = rows;
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }
}

/// Partial update of a persisted session.
///
/// `None` leaves a field untouched; for nullable columns `Some(None)` clears
/// the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub kind: Option<SessionKind>,
    pub workdir: Option<PathBuf>,
    pub command: Option<String>,
    pub flags: Option<Vec<String>>,
    pub status: Option<SessionStatus>,
    pub pid: Option<Option<u32>>,
    pub channel_address: Option<PathBuf>,
    pub exit_code: Option<Option<i32>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    /// Status transition stamped with the current time.
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            updated_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Marks the session stopped and clears its pid.
    pub fn stopped() -> Self {
        Self {
            pid: Some(None),
            ..Self::status(SessionStatus::Stopped)
        }
    }

    /// Dimension change stamped with the current time.
    pub fn dimensions(cols: u16, rows: u16) -> Self {
        Self {
            cols: Some(cols),
            rows: Some(rows),
            updated_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Full overwrite of every mutable column from `session`.
    pub fn replace_with(session: &Session) -> Self {
        Self {
            name: Some(session.name.clone()),
            kind: Some(session.kind),
            workdir: Some(session.workdir.clone()),
            command: Some(session.command.clone()),
            flags: Some(session.flags.clone()),
            status: Some(session.status),
            pid: Some(session.pid),
            channel_address: Some(session.channel_address.clone()),
            exit_code: Some(session.exit_code),
            cols: Some(session.cols),
            rows: Some(session.rows),
            updated_at: Some(session.updated_at),
        }
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Reuse an identity (restart); a fresh UUID otherwise.
    #[serde(default)]
    pub id: Option<SessionId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub workdir: PathBuf,
    /// Shell sessions only: command to run instead of the default shell.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

impl CreateSessionRequest {
    /// Minimal request for `kind` in `workdir`.
    pub fn new(kind: SessionKind, workdir: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            name: None,
            kind,
            workdir: workdir.into(),
            command: None,
            flags: Vec::new(),
            cols: None,
            rows: None,
        }
    }

    /// Request recreating `session` under the same identity.
    pub fn from_session(session: &Session) -> Self {
        let command = match session.kind {
            SessionKind::Shell => Some(session.command.clone()),
            SessionKind::Claude | SessionKind::Droid => None,
        };
        Self {
            id: Some(session.id.clone()),
            name: Some(session.name.clone()),
            kind: session.kind,
            workdir: session.workdir.clone(),
            command,
            flags: session.flags.clone(),
            cols: Some(session.cols),
            rows: Some(session.rows),
        }
    }
}

/// Default tmux session name: `{type}-{first 8 chars of id}`.
pub fn default_session_name(kind: SessionKind, id: &str) -> String {
    let prefix: String = id.chars().take(8).collect();
    format!("{}-{}", kind, prefix)
}
