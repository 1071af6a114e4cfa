//! Attach channels.
//!
//! An attach channel is a live process running in a pseudo-terminal,
//! normally `tmux attach-session`, whose output is streamed as
//! [`ChannelEvent`]s and whose input and window size can be driven from the
//! daemon. Each channel reports exactly one [`ChannelEvent::Exit`].

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, Mutex};

use super::error::SessionError;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the exit waiter lets the reader drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Program to run inside the pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Variables removed from the inherited environment.
    pub unset_env: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AttachRequest {
    /// Label used in errors and logs, usually the tmux session name.
    pub label: String,
    pub command: AttachCommand,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Something that happened on a channel, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    /// Final event; carries the process exit code.
    Exit(i32),
}

/// Bidirectional handle to a live attach process.
#[async_trait]
pub trait AttachChannel: Send + Sync {
    /// OS process id, when the platform reports one.
    fn pid(&self) -> Option<u32>;

    /// False once the process exited or was terminated.
    fn is_alive(&self) -> bool;

    /// Writes input. Fails with [`SessionError::AlreadyTerminated`] after exit.
    async fn write(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Changes the terminal window size. Fails after exit.
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Kills the process. The exit event still arrives on the event stream.
    async fn terminate(&self);
}

/// A freshly spawned channel and its event stream.
pub struct AttachHandle {
    pub channel: Arc<dyn AttachChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Factory for attach channels.
pub trait AttachSpawner: Send + Sync {
    fn spawn(&self, request: AttachRequest) -> Result<AttachHandle, SessionError>;
}

/// [`AttachSpawner`] running processes in native pseudo-terminals.
///
/// Must be called from within a Tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct PtySpawner;

impl PtySpawner {
    pub fn new() -> Self {
        Self
    }
}

impl AttachSpawner for PtySpawner {
    fn spawn(&self, request: AttachRequest) -> Result<AttachHandle, SessionError> {
        let spawn_err = |e: &dyn std::fmt::Display| {
            SessionError::SpawnFailed(format!("{}: {}", request.label, e))
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_err(&e))?;

        let mut cmd = CommandBuilder::new(&request.command.program);
        cmd.args(&request.command.args);
        cmd.cwd(&request.cwd);
        for var in &request.command.unset_env {
            cmd.env_remove(var);
        }
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| spawn_err(&e))?;
        // Reads hit EOF only once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair.master.try_clone_reader().map_err(|e| spawn_err(&e))?;
        let writer = pair.master.take_writer().map_err(|e| spawn_err(&e))?;

        let alive = Arc::new(AtomicBool::new(true));
        let (events_tx, events) = mpsc::unbounded_channel();

        let reader_task = {
            let tx = events_tx.clone();
            let label = request.label.clone();
            tokio::task::spawn_blocking(move || read_loop(reader, tx, &label))
        };

        {
            let alive = Arc::clone(&alive);
            let label = request.label.clone();
            tokio::spawn(async move {
                let status = tokio::task::spawn_blocking(move || child.wait()).await;
                alive.store(false, Ordering::SeqCst);

                let code = match status {
                    Ok(Ok(status)) => status.exit_code() as i32,
                    Ok(Err(e)) => {
                        tracing::warn!(channel = %label, error = %e, "Failed to wait for attach process");
                        -1
                    }
                    Err(e) => {
                        tracing::error!(channel = %label, error = %e, "Attach waiter panicked");
                        -1
                    }
                };

                if tokio::time::timeout(DRAIN_TIMEOUT, reader_task).await.is_err() {
                    tracing::debug!(channel = %label, "Reader still blocked after exit");
                }

                tracing::debug!(channel = %label, exit_code = code, "Attach process exited");
                let _ = events_tx.send(ChannelEvent::Exit(code));
            });
        }

        tracing::debug!(channel = %request.label, pid = ?pid, "Attach process spawned");

        let channel = PtyChannel {
            label: request.label,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            alive,
            pid,
        };
        Ok(AttachHandle {
            channel: Arc::new(channel),
            events,
        })
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    label: &str,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx
                    .send(ChannelEvent::Data(Bytes::copy_from_slice(&buffer[..n])))
                    .is_err()
                {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is the normal end of a PTY whose child exited.
                tracing::trace!(channel = %label, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Channel over a native PTY.
pub struct PtyChannel {
    label: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
}

#[async_trait]
impl AttachChannel for PtyChannel {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.label.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.label.clone()));
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        tracing::debug!(channel = %self.label, cols, rows, "Resized PTY");
        Ok(())
    }

    async fn terminate(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut killer = self.killer.lock().await;
        if let Err(e) = killer.kill() {
            tracing::debug!(channel = %self.label, error = %e, "Kill of attach process failed");
        }
    }
}
