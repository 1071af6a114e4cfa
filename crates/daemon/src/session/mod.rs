//! Session management module.
//!
//! Sessions are tmux sessions on private sockets. The daemon keeps one PTY
//! attach channel per live session, records every session in a store, and
//! fans output out to joined viewers.

pub mod backlog;
pub mod command;
pub mod error;
#[cfg(test)]
pub mod fake;
pub mod forwarder;
pub mod manager;
pub mod pty;
pub mod store;
pub mod tmux;
pub mod types;

pub use error::SessionError;
pub use forwarder::{Forwarder, ViewerId, ViewerStats};
pub use manager::{LiveSession, SessionEvent, SessionManager};
pub use pty::{AttachSpawner, PtySpawner};
pub use store::{MemoryStore, SessionStore, StoreError};
pub use tmux::{Multiplexer, MultiplexerError, TmuxAdapter};
pub use types::{CreateSessionRequest, Session, SessionId, SessionKind, SessionPatch};
