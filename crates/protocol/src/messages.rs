//! Protocol message definitions for Terminal Nexus.
//!
//! This module defines the forwarding protocol spoken between the daemon and
//! terminal viewers. Messages are JSON objects of the form
//! `{"type": "...", "data": {...}}`; terminal bytes travel base64-encoded.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Viewer -> daemon
    /// Join a session's broadcast group.
    TerminalJoin(TerminalJoin),
    /// Leave a session's broadcast group.
    TerminalLeave(TerminalLeave),
    /// Keyboard input for a session.
    TerminalInput(TerminalInput),
    /// Request a new terminal size.
    TerminalResize(TerminalResize),

    // Daemon -> viewer
    /// A chunk of terminal output.
    TerminalOutput(TerminalOutput),
    /// Current status of a session.
    TerminalStatus(TerminalStatus),
    /// The session's attach process exited.
    TerminalExited(TerminalExited),
    /// Terminal dimensions changed (echoed to every viewer of the session).
    TerminalResized(TerminalResized),
    /// A session was created or restarted (sent to every viewer).
    SessionCreated(SessionCreated),
    /// A session was killed (sent to every viewer).
    SessionKilled(SessionKilled),

    // Control messages
    /// Ping for keepalive.
    Ping(Ping),
    /// Pong response to ping.
    Pong(Pong),
    /// Error message.
    Error(ErrorMessage),
}

impl Message {
    /// Returns the session this message refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::TerminalJoin(m) => Some(&m.session_id),
            Message::TerminalLeave(m) => Some(&m.session_id),
            Message::TerminalInput(m) => Some(&m.session_id),
            Message::TerminalResize(m) => Some(&m.session_id),
            Message::TerminalOutput(m) => Some(&m.session_id),
            Message::TerminalStatus(m) => Some(&m.session_id),
            Message::TerminalExited(m) => Some(&m.session_id),
            Message::TerminalResized(m) => Some(&m.session_id),
            Message::SessionCreated(m) => Some(&m.session_id),
            Message::SessionKilled(m) => Some(&m.session_id),
            Message::Error(m) => m.context.as_deref(),
            Message::Ping(_) | Message::Pong(_) => None,
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(ProtocolError::from)
    }
}

/// Lifecycle status of a session as seen by viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Attached and producing output.
    Running,
    /// Exited cleanly or was killed.
    Stopped,
    /// Exited with a failure, or could not be reached.
    Error,
}

impl SessionStatus {
    /// Returns the lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    /// Status that a finished attach process with `exit_code` leaves behind.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            SessionStatus::Stopped
        } else {
            SessionStatus::Error
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            "error" => Ok(SessionStatus::Error),
            other => Err(ProtocolError::InvalidValue(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

// ============================================================================
// Terminal Messages
// ============================================================================

/// Request to join a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalJoin {
    /// Session to join.
    pub session_id: String,
}

/// Request to leave a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalLeave {
    /// Session to leave.
    pub session_id: String,
}

/// Input bytes destined for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    /// Target session.
    pub session_id: String,
    /// Raw input bytes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Request to resize a session's terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResize {
    /// Target session.
    pub session_id: String,
    /// New width in columns.
    pub cols: u16,
    /// New height in rows.
    pub rows: u16,
}

/// Output produced by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    /// Source session.
    pub session_id: String,
    /// Raw output bytes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Session status notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalStatus {
    /// Session the status refers to.
    pub session_id: String,
    /// Current status.
    pub status: SessionStatus,
}

/// Attach process exit notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalExited {
    /// Session whose process exited.
    pub session_id: String,
    /// Exit code reported by the process.
    pub exit_code: i32,
}

/// Resize broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResized {
    /// Session that was resized.
    pub session_id: String,
    /// New width in columns.
    pub cols: u16,
    /// New height in rows.
    pub rows: u16,
}

// ============================================================================
// Lifecycle Messages
// ============================================================================

/// Announcement of a new or restarted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub name: String,
    /// Session kind: `claude`, `droid` or `shell`.
    pub session_type: String,
    pub workdir: String,
    pub status: SessionStatus,
}

/// Announcement of a killed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKilled {
    pub session_id: String,
}

// ============================================================================
// Control Messages
// ============================================================================

/// Ping for keepalive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent (for latency calculation).
    pub timestamp: u64,
}

/// Pong response to ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Original timestamp from ping.
    pub timestamp: u64,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (usually the session id).
    pub context: Option<String>,
}

impl ErrorMessage {
    /// Builds an error scoped to a session.
    pub fn for_session(code: ErrorCode, session_id: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Some(session_id.to_string()),
        }
    }
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Resource not found.
    NotFound,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Server-side error.
    InternalError,
    /// Resource already exists.
    AlreadyExists,
    /// A required external program is missing.
    DependencyMissing,
}

/// Serde adapter encoding byte buffers as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
