//! Unix Domain Socket IPC for the CLI and for terminal viewers.
//!
//! The protocol is newline-delimited JSON: each line is one [`IpcRequest`]
//! or [`IpcResponse`]. Control requests get exactly one response. A
//! connection that sends [`IpcRequest::Viewer`] becomes a viewer and also
//! receives [`IpcResponse::Viewer`] pushes until it disconnects.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/terminal-nexus/daemon.sock`
//! - Fallback: `/tmp/terminal-nexus-$UID/daemon.sock`
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running};
pub use server::{IpcConnection, IpcError, IpcServer, RequestReader, ResponseWriter};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/terminal-nexus/daemon.sock`
/// 2. Otherwise: `/tmp/terminal-nexus-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir)
                .join("terminal-nexus")
                .join("daemon.sock");
        }
    }

    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/terminal-nexus-{}", uid)).join("daemon.sock")
}
