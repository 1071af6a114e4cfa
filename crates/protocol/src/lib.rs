//! # Terminal Nexus Protocol Library
//!
//! Wire vocabulary shared by the Terminal Nexus daemon and its terminal
//! viewers.
//!
//! ## Overview
//!
//! Viewers join a session's broadcast group, send keyboard input and resize
//! requests, and receive output, status, exit and resize notifications:
//!
//! ```text
//!  viewer                                daemon
//!    │  TerminalJoin { session_id }        │
//!    │ ──────────────────────────────────▶ │
//!    │  TerminalStatus { running }         │
//!    │ ◀────────────────────────────────── │
//!    │  TerminalOutput (backlog replay)    │
//!    │ ◀────────────────────────────────── │
//!    │  TerminalInput / TerminalResize     │
//!    │ ──────────────────────────────────▶ │
//!    │  TerminalOutput / TerminalResized   │
//!    │ ◀────────────────────────────────── │
//!    │  TerminalExited + TerminalStatus    │
//!    │ ◀────────────────────────────────── │
//!    │  SessionCreated / SessionKilled     │
//!    │ ◀────────────────────────────────── │
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::messages::{Message, TerminalJoin};
//!
//! let join = Message::TerminalJoin(TerminalJoin {
//!     session_id: "3f2a...".to_string(),
//! });
//! let json = join.to_json().unwrap();
//! assert_eq!(Message::from_json(&json).unwrap(), join);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{ErrorCode, ErrorMessage, Message, SessionStatus};
