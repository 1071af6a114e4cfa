//! tmux process adapter.
//!
//! Every call runs the tmux binary as a short-lived subprocess against a
//! per-session control socket (`-S <address>`), so each session lives in its
//! own tmux server. The adapter keeps no session state; it only caches the
//! resolved binary path.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::OnceLock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use super::pty::AttachCommand;

/// Environment variables that make tmux think it is nested.
const NESTING_ENV: &[&str] = &["TMUX", "TMUX_PANE"];

/// `list-sessions` record format. Parsed from the right so names may contain `:`.
const LIST_FORMAT: &str = "#{session_id}:#{session_name}:#{session_created}:#{session_attached}:#{session_width}x#{session_height}";

/// stderr fragments meaning the target session or server is already gone.
const GONE_MARKERS: &[&str] = &[
    "no server running",
    "session not found",
    "can't find session",
    "no such file or directory",
    "error connecting to",
    "failed to connect to server",
];

/// Errors raised by tmux invocations.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    /// The tmux binary could not be resolved.
    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    /// tmux exited non-zero.
    #[error("tmux {operation} failed: {stderr}")]
    CommandFailed {
        operation: &'static str,
        stderr: String,
    },

    /// tmux could not be executed at all.
    #[error("tmux {operation} could not be run: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// One row of `list-sessions` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    /// tmux-internal id such as `$0`.
    pub id: String,
    pub name: String,
    /// Creation time, seconds since the epoch.
    pub created: i64,
    /// Number of attached clients.
    pub attached: u32,
    pub cols: u16,
    pub rows: u16,
}

/// Parameters of a detached `new-session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSessionSpec {
    pub name: String,
    pub workdir: PathBuf,
    pub command: String,
    pub address: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Operations the orchestrator needs from a terminal multiplexer.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Control socket owning the session with this id.
    fn channel_address(&self, session_id: &str) -> PathBuf;

    /// Program and arguments that attach a terminal to `name`.
    fn attach_command(&self, name: &str, address: &Path) -> Result<AttachCommand, MultiplexerError>;

    /// Issues a detached session create. Callers verify visibility themselves.
    async fn create_session(&self, spec: &RemoteSessionSpec) -> Result<(), MultiplexerError>;

    /// Kills a session; an already-absent session or server is success.
    async fn kill_session(&self, name: &str, address: &Path) -> Result<(), MultiplexerError>;

    /// Lists sessions on a server; an unreachable server yields an empty list.
    async fn list_sessions(&self, address: &Path) -> Result<Vec<RemoteSession>, MultiplexerError>;

    async fn resize_session(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        address: &Path,
    ) -> Result<(), MultiplexerError>;

    /// Plain-text snapshot of the visible pane, plus `history` scrollback lines.
    async fn capture_pane(
        &self,
        name: &str,
        address: &Path,
        history: Option<u32>,
    ) -> Result<String, MultiplexerError>;

    /// Types `text` into the pane followed by Enter.
    async fn send_keys(&self, name: &str, address: &Path, text: &str)
        -> Result<(), MultiplexerError>;

    /// Whether `name` currently appears in the server's session list.
    async fn has_session(&self, name: &str, address: &Path) -> Result<bool, MultiplexerError> {
        Ok(self
            .list_sessions(address)
            .await?
            .iter()
            .any(|s| s.name == name))
    }
}

/// [`Multiplexer`] backed by the tmux CLI.
pub struct TmuxAdapter {
    socket_dir: PathBuf,
    binary_override: Option<PathBuf>,
    binary: OnceLock<Result<PathBuf, String>>,
}

impl TmuxAdapter {
    /// Creates an adapter placing control sockets under `socket_dir`.
    pub fn new(socket_dir: impl Into<PathBuf>, binary_override: Option<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            binary_override,
            binary: OnceLock::new(),
        }
    }

    /// Locates the tmux binary once and caches the outcome.
    pub fn resolve_binary(&self) -> Result<&Path, MultiplexerError> {
        let resolved = self.binary.get_or_init(|| {
            let candidate = self
                .binary_override
                .clone()
                .unwrap_or_else(|| PathBuf::from("tmux"));
            if candidate.is_absolute() {
                if candidate.is_file() {
                    Ok(candidate)
                } else {
                    Err(format!("tmux binary not found at {}", candidate.display()))
                }
            } else {
                which::which(&candidate)
                    .map_err(|_| format!("{} not found in PATH", candidate.display()))
            }
        });

        match resolved {
            Ok(path) => Ok(path.as_path()),
            Err(msg) => Err(MultiplexerError::Unavailable(msg.clone())),
        }
    }

    async fn ensure_socket_dir(&self) -> Result<(), MultiplexerError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&self.socket_dir)
            .await
            .map_err(|source| MultiplexerError::Io {
                operation: "mkdir",
                source,
            })
    }

    async fn run(
        &self,
        operation: &'static str,
        address: &Path,
        args: &[&str],
    ) -> Result<Output, MultiplexerError> {
        let binary = self.resolve_binary()?;

        let mut cmd = Command::new(binary);
        cmd.arg("-S").arg(address).args(args).kill_on_drop(true);
        for var in NESTING_ENV {
            cmd.env_remove(var);
        }

        tracing::trace!(operation, address = %address.display(), ?args, "Running tmux");
        cmd.output()
            .await
            .map_err(|source| MultiplexerError::Io { operation, source })
    }

    /// Runs a command and maps a non-zero exit to [`MultiplexerError::CommandFailed`].
    async fn run_checked(
        &self,
        operation: &'static str,
        address: &Path,
        args: &[&str],
    ) -> Result<Output, MultiplexerError> {
        let output = self.run(operation, address, args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = stderr_of(&output);
            tracing::debug!(operation, stderr = %stderr, "tmux command failed");
            Err(MultiplexerError::CommandFailed { operation, stderr })
        }
    }
}

#[async_trait]
impl Multiplexer for TmuxAdapter {
    fn channel_address(&self, session_id: &str) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", session_id))
    }

    fn attach_command(&self, name: &str, address: &Path) -> Result<AttachCommand, MultiplexerError> {
        let binary = self.resolve_binary()?;
        Ok(AttachCommand {
            program: binary.to_path_buf(),
            args: vec![
                "-S".to_string(),
                address.to_string_lossy().into_owned(),
                "attach-session".to_string(),
                "-t".to_string(),
                name.to_string(),
            ],
            unset_env: NESTING_ENV.iter().map(|v| v.to_string()).collect(),
        })
    }

    async fn create_session(&self, spec: &RemoteSessionSpec) -> Result<(), MultiplexerError> {
        self.ensure_socket_dir().await?;

        let workdir = spec.workdir.to_string_lossy();
        let cols = spec.cols.to_string();
        let rows = spec.rows.to_string();
        self.run_checked(
            "new-session",
            &spec.address,
            &[
                "new-session",
                "-d",
                "-s",
                &spec.name,
                "-c",
                &workdir,
                "-x",
                &cols,
                "-y",
                &rows,
                &spec.command,
            ],
        )
        .await?;

        tracing::debug!(name = %spec.name, address = %spec.address.display(), "tmux session created");
        Ok(())
    }

    async fn kill_session(&self, name: &str, address: &Path) -> Result<(), MultiplexerError> {
        let output = self
            .run("kill-session", address, &["kill-session", "-t", name])
            .await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = stderr_of(&output);
        if is_gone(&stderr) {
            tracing::debug!(name, stderr = %stderr, "tmux session already gone");
            Ok(())
        } else {
            Err(MultiplexerError::CommandFailed {
                operation: "kill-session",
                stderr,
            })
        }
    }

    async fn list_sessions(&self, address: &Path) -> Result<Vec<RemoteSession>, MultiplexerError> {
        let output = self
            .run("list-sessions", address, &["list-sessions", "-F", LIST_FORMAT])
            .await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_gone(&stderr) {
                return Ok(Vec::new());
            }
            return Err(MultiplexerError::CommandFailed {
                operation: "list-sessions",
                stderr,
            });
        }

        Ok(parse_session_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn resize_session(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        address: &Path,
    ) -> Result<(), MultiplexerError> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        self.run_checked(
            "resize-window",
            address,
            &["resize-window", "-t", name, "-x", &cols, "-y", &rows],
        )
        .await?;
        Ok(())
    }

    async fn capture_pane(
        &self,
        name: &str,
        address: &Path,
        history: Option<u32>,
    ) -> Result<String, MultiplexerError> {
        let start = history.map(|n| format!("-{}", n));
        let mut args = vec!["capture-pane", "-p", "-t", name];
        if let Some(start) = start.as_deref() {
            args.extend(["-S", start]);
        }

        let output = self.run_checked("capture-pane", address, &args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn send_keys(
        &self,
        name: &str,
        address: &Path,
        text: &str,
    ) -> Result<(), MultiplexerError> {
        self.run_checked("send-keys", address, &["send-keys", "-t", name, text, "C-m"])
            .await?;
        Ok(())
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_gone(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    GONE_MARKERS.iter().any(|m| lower.contains(m))
}

fn parse_session_list(stdout: &str) -> Vec<RemoteSession> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_session_line(line);
            if parsed.is_none() {
                tracing::warn!(line, "Skipping malformed tmux list-sessions line");
            }
            parsed
        })
        .collect()
}

fn parse_session_line(line: &str) -> Option<RemoteSession> {
    let (id, rest) = line.trim().split_once(':')?;

    let mut tail = rest.rsplitn(4, ':');
    let size = tail.next()?;
    let attached = tail.next()?.parse().ok()?;
    let created = tail.next()?.parse().ok()?;
    let name = tail.next()?;

    let (cols, rows) = size.split_once('x')?;
    Some(RemoteSession {
        id: id.to_string(),
        name: name.to_string(),
        created,
        attached,
        cols: cols.parse().ok()?,
        rows: rows.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_line() {
        let session = parse_session_line("$3:shell-0b5e7c9a:1718000000:1:120x40").unwrap();
        assert_eq!(
            session,
            RemoteSession {
                id: "$3".to_string(),
                name: "shell-0b5e7c9a".to_string(),
                created: 1_718_000_000,
                attached: 1,
                cols: 120,
                rows: 40,
            }
        );
    }

    #[test]
    fn test_parse_name_with_colons() {
        let session = parse_session_line("$0:build:release:1718000000:0:80x24").unwrap();
        assert_eq!(session.name, "build:release");
        assert_eq!(session.attached, 0);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_session_line("garbage").is_none());
        assert!(parse_session_line("$0:name:notanumber:0:80x24").is_none());
        assert!(parse_session_line("$0:name:1:0:80by24").is_none());
    }

    #[test]
    fn test_parse_session_list_skips_blank_lines() {
        let out = "$0:a:1:0:80x24\n\n$1:b:2:1:100x30\nbad\n";
        let sessions = parse_session_list(out);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].name, "b");
    }

    #[test]
    fn test_gone_detection() {
        assert!(is_gone("no server running on /tmp/terminal-nexus/x.sock"));
        assert!(is_gone("can't find session: shell-1234"));
        assert!(is_gone("error connecting to /tmp/x.sock (No such file or directory)"));
        assert!(!is_gone("unknown option -- z"));
    }

    #[test]
    fn test_channel_address_is_deterministic() {
        let adapter = TmuxAdapter::new("/tmp/terminal-nexus", None);
        assert_eq!(
            adapter.channel_address("abc"),
            PathBuf::from("/tmp/terminal-nexus/abc.sock")
        );
        assert_eq!(adapter.channel_address("abc"), adapter.channel_address("abc"));
    }

    #[test]
    fn test_missing_override_is_unavailable() {
        let adapter = TmuxAdapter::new(
            "/tmp/terminal-nexus",
            Some(PathBuf::from("/nonexistent/bin/tmux")),
        );
        let err = adapter.resolve_binary().unwrap_err();
        assert!(matches!(err, MultiplexerError::Unavailable(_)));

        // Cached failure is reported again without re-probing.
        assert!(adapter
            .attach_command("x", Path::new("/tmp/x.sock"))
            .is_err());
    }

    #[tokio::test]
    async fn test_operations_fail_when_binary_missing() {
        let adapter = TmuxAdapter::new(
            "/tmp/terminal-nexus",
            Some(PathBuf::from("/nonexistent/bin/tmux")),
        );
        let err = adapter
            .list_sessions(Path::new("/tmp/terminal-nexus/none.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, MultiplexerError::Unavailable(_)));
    }
}
