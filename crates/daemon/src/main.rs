//! Terminal Nexus daemon and control CLI.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{get_daemon_pid, get_socket_path, is_daemon_running, IpcClient, IpcRequest, IpcResponse};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::protocol::messages::TerminalJoin;
use daemon::protocol::{Message, SessionStatus};
use daemon::session::{CreateSessionRequest, Session, SessionKind};
use tracing_subscriber::EnvFilter;

/// Terminal Nexus - tmux-backed terminal sessions with live viewers.
#[derive(Parser, Debug)]
#[command(name = "nexus-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Include stopped and failed sessions
        #[arg(long, short)]
        all: bool,
    },

    /// Create a session
    Create {
        /// Session type: claude, droid or shell
        #[arg(long = "type", short = 't', value_name = "TYPE")]
        kind: SessionKind,

        /// Working directory (absolute)
        #[arg(long, short)]
        workdir: PathBuf,

        /// tmux session name
        #[arg(long, short)]
        name: Option<String>,

        /// Command for shell sessions
        #[arg(long)]
        command: Option<String>,

        /// Launch flag, repeatable (e.g. --flag=--yolo)
        #[arg(long = "flag", value_name = "FLAG", allow_hyphen_values = true)]
        flags: Vec<String>,

        #[arg(long)]
        cols: Option<u16>,

        #[arg(long)]
        rows: Option<u16>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Kill a session
    Kill { session_id: String },

    /// Resize a session
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    /// Kill and recreate a session with the same id and settings
    Restart { session_id: String },

    /// Print the recent output backlog of a live session
    Output {
        session_id: String,

        /// Number of chunks
        #[arg(short = 'n', long)]
        chunks: Option<usize>,
    },

    /// Print a text snapshot of the session's pane
    Capture {
        session_id: String,

        /// Scrollback lines to include
        #[arg(long, short)]
        lines: Option<u32>,
    },

    /// Type text followed by Enter into the session
    Send { session_id: String, text: String },

    /// Stream live output to stdout until the session ends
    Watch { session_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;

    let socket_path = config
        .ipc
        .socket_path
        .clone()
        .unwrap_or_else(get_socket_path);

    match cli.command {
        Commands::Start => {
            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  nexus-daemon stop");
                std::process::exit(1);
            }

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_foreground(&mut orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::info!(force, "Stopping daemon");

            let result = if force {
                force_stop_daemon(&socket_path)
            } else {
                graceful_stop_daemon(&socket_path, timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: nexus-daemon stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match request(&socket_path, IpcRequest::Status).await {
            Ok(IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                viewer_count,
            }) => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "stopping" }
                );
                println!("  Uptime:   {}", format_duration(uptime_secs));
                println!("  Sessions: {}", session_count);
                println!("  Viewers:  {}", viewer_count);
            }
            Ok(other) => anyhow::bail!("Unexpected response from daemon: {:?}", other),
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(cmd) => {
            if let Err(e) = run_sessions_command(&socket_path, cmd).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn run_sessions_command(socket_path: &Path, cmd: SessionsCommands) -> anyhow::Result<()> {
    match cmd {
        SessionsCommands::List { json, all } => {
            match request(socket_path, IpcRequest::ListSessions { all }).await? {
                IpcResponse::Sessions { sessions } if json => {
                    println!("{}", serde_json::to_string_pretty(&sessions)?)
                }
                IpcResponse::Sessions { sessions } => print_sessions_table(&sessions),
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Create {
            kind,
            workdir,
            name,
            command,
            flags,
            cols,
            rows,
            json,
        } => {
            let create = CreateSessionRequest {
                name,
                command,
                flags,
                cols,
                rows,
                ..CreateSessionRequest::new(kind, absolute(workdir)?)
            };
            match request(socket_path, IpcRequest::CreateSession(create)).await? {
                IpcResponse::Session(session) if json => {
                    println!("{}", serde_json::to_string_pretty(&session)?)
                }
                IpcResponse::Session(session) => {
                    println!("Created session {} ({})", session.id, session.name)
                }
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Kill { session_id } => {
            match request(socket_path, IpcRequest::KillSession { session_id }).await? {
                IpcResponse::SessionKilled { session_id } => {
                    println!("Session {} stopped", session_id)
                }
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Resize {
            session_id,
            cols,
            rows,
        } => {
            let resize = IpcRequest::ResizeSession {
                session_id,
                cols,
                rows,
            };
            match request(socket_path, resize).await? {
                IpcResponse::SessionResized {
                    session_id,
                    cols,
                    rows,
                } => println!("Session {} resized to {}x{}", session_id, cols, rows),
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Restart { session_id } => {
            match request(socket_path, IpcRequest::RestartSession { session_id }).await? {
                IpcResponse::Session(session) => {
                    println!("Session {} restarted (pid {:?})", session.id, session.pid)
                }
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Output { session_id, chunks } => {
            match request(socket_path, IpcRequest::RecentOutput { session_id, chunks }).await? {
                IpcResponse::Output { data, .. } => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Capture { session_id, lines } => {
            match request(socket_path, IpcRequest::Capture { session_id, lines }).await? {
                IpcResponse::Capture { text, .. } => print!("{}", text),
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Send { session_id, text } => {
            match request(socket_path, IpcRequest::SendKeys { session_id, text }).await? {
                IpcResponse::KeysSent { .. } => {}
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Watch { session_id } => watch_session(socket_path, session_id).await?,
    }
    Ok(())
}

async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Send one request; an error response becomes an `Err`.
async fn request(socket_path: &Path, request: IpcRequest) -> anyhow::Result<IpcResponse> {
    let mut client = connect(socket_path).await?;
    // Create and restart wait on tmux and agent startup.
    client.set_timeout(Duration::from_secs(30));
    match client.send(request).await? {
        IpcResponse::Error { code, message } => anyhow::bail!("{} ({:?})", message, code),
        response => Ok(response),
    }
}

fn unexpected(response: IpcResponse) -> anyhow::Result<()> {
    anyhow::bail!("Unexpected response from daemon: {:?}", response)
}

fn absolute(path: PathBuf) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Join a session as a viewer and copy its output to stdout.
async fn watch_session(socket_path: &Path, session_id: String) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;
    client
        .send_viewer(Message::TerminalJoin(TerminalJoin {
            session_id: session_id.clone(),
        }))
        .await?;

    let mut stdout = std::io::stdout();
    loop {
        let response = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            response = client.recv() => response?,
        };
        let Some(response) = response else {
            eprintln!("\r\nDaemon closed the connection");
            break;
        };

        match response {
            IpcResponse::Viewer(Message::TerminalOutput(out)) => {
                stdout.write_all(&out.data)?;
                stdout.flush()?;
            }
            IpcResponse::Viewer(Message::TerminalStatus(status)) => match status.status {
                SessionStatus::Running => {}
                SessionStatus::Error => anyhow::bail!("Session {} is unavailable", session_id),
                SessionStatus::Stopped => {
                    eprintln!("\r\nSession {} stopped", session_id);
                    break;
                }
            },
            IpcResponse::Viewer(Message::TerminalExited(exited)) => {
                eprintln!("\r\nSession exited with code {}", exited.exit_code);
            }
            IpcResponse::Viewer(Message::Error(err)) => {
                eprintln!("\r\nError: {}", err.message);
            }
            other => tracing::debug!(response = ?other, "Ignoring response"),
        }
    }
    Ok(())
}

fn print_sessions_table(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let name_width = sessions
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(4)
        .clamp(4, 32);

    println!(
        "{:<36}  {:<name_width$}  {:<6}  {:<7}  {:>7}  {:>9}",
        "ID",
        "NAME",
        "TYPE",
        "STATUS",
        "SIZE",
        "CREATED",
        name_width = name_width
    );
    println!("{}", "-".repeat(36 + name_width + 6 + 7 + 7 + 9 + 10));

    for session in sessions {
        println!(
            "{:<36}  {:<name_width$}  {:<6}  {:<7}  {:>7}  {:>9}",
            truncate_str(&session.id, 36),
            truncate_str(&session.name, name_width),
            session.kind.as_str(),
            session.status.as_str(),
            format!("{}x{}", session.cols, session.rows),
            format_relative_time(session.created_at),
            name_width = name_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a timestamp as relative time (e.g., "5m ago").
fn format_relative_time(at: DateTime<Utc>) -> String {
    let elapsed = (Utc::now() - at).num_seconds().max(0) as u64;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Gracefully stop the daemon via IPC and wait for it to exit.
async fn graceful_stop_daemon(socket_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    println!("Sending shutdown request...");
    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        IpcResponse::Error { message, .. } => anyhow::bail!("Daemon returned error: {}", message),
        other => unexpected(other)?,
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon using SIGKILL on the PID from the PID file.
fn force_stop_daemon(socket_path: &Path) -> anyhow::Result<()> {
    use daemon::ipc::get_pid_file_path;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = get_pid_file_path();
    let Some(pid) = get_daemon_pid() else {
        anyhow::bail!("No running daemon found in {}", pid_path.display());
    };
    let pid = i32::try_from(pid)?;

    kill(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the daemon until a signal or an IPC stop request arrives.
async fn run_foreground(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!(?state, "Orchestrator state");
                }
                OrchestratorEvent::SessionsRecovered { count } => {
                    tracing::info!(count, "Sessions recovered");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested");
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}
