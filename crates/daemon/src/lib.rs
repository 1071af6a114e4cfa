//! # Terminal Nexus Daemon Library
//!
//! Long-lived interactive terminal sessions (shells and CLI agents) backed
//! by tmux, so they survive daemon restarts, with realtime output fan-out to
//! any number of viewers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │   IPC server  ──►  Router  ──►  Forwarder (viewer groups)    │
//! │                       │              │                       │
//! │                       ▼              ▼                       │
//! │                  Session Manager (registry, generations)     │
//! │                   │            │              │              │
//! │                   ▼            ▼              ▼              │
//! │             TmuxAdapter   PtySpawner     SqliteStore         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     orchestrator.shutdown_token().cancelled().await;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: tmux adapter, attach channels, the session manager and forwarder
//! - [`storage`]: SQLite session records
//! - [`ipc`]: Unix socket transport for the CLI and viewers
//! - [`router`]: Request dispatch
//! - [`orchestrator`]: Composition root

pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod router;
pub mod session;
pub mod storage;

pub use protocol;

pub use config::Config;

pub use session::{
    CreateSessionRequest, Forwarder, Session, SessionError, SessionId, SessionKind,
    SessionManager,
};

pub use router::{Router, RouterError, RouterResult};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
