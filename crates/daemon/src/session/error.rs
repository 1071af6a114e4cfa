//! Error type shared by the session orchestration layer.

use protocol::ErrorCode;
use thiserror::Error;

use super::store::StoreError;
use super::tmux::MultiplexerError;
use super::types::SessionId;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Neither a live nor a persisted session exists for the id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// A live session with this id is already registered.
    #[error("session already running: {0}")]
    AlreadyRunning(SessionId),

    /// The session exists but is not running.
    #[error("session not running: {0}")]
    NotRunning(SessionId),

    /// The attach channel has exited; writes and resizes are rejected.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// A binary the session needs is not on PATH.
    #[error("dependency unavailable: {0}")]
    DependencyMissing(String),

    /// tmux never listed the session within the verification budget.
    #[error("session not visible after creation: {0}")]
    NotVisible(String),

    /// The working directory was rejected.
    #[error("invalid workdir {path}: {reason}")]
    InvalidWorkdir { path: String, reason: String },

    /// A tmux invocation failed.
    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),

    /// Failed to spawn the attach process.
    #[error("failed to spawn attach process: {0}")]
    SpawnFailed(String),

    /// Failed to write to the attach process.
    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    /// Failed to resize the attach process.
    #[error("failed to resize session: {0}")]
    ResizeFailed(String),

    /// Persisted record store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Whether the error reports a missing external binary.
    pub fn is_dependency_missing(&self) -> bool {
        matches!(
            self,
            SessionError::DependencyMissing(_)
                | SessionError::Multiplexer(MultiplexerError::Unavailable(_))
        )
    }

    /// Wire error code reported to viewers and control clients.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::AlreadyRunning(_) => ErrorCode::AlreadyExists,
            SessionError::NotRunning(_)
            | SessionError::AlreadyTerminated(_)
            | SessionError::InvalidWorkdir { .. } => ErrorCode::InvalidRequest,
            _ if self.is_dependency_missing() => ErrorCode::DependencyMissing,
            _ => ErrorCode::InternalError,
        }
    }
}
