//! PID file utilities for daemon running detection.
//!
//! The PID file lives at `$XDG_DATA_HOME/terminal-nexus/daemon.pid`, or
//! `~/.local/share/terminal-nexus/daemon.pid` when XDG_DATA_HOME is unset.
//! Stale files (unparsable, or naming a dead process) are removed on read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("terminal-nexus").join("daemon.pid")
}

/// Check if a daemon process is currently running.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
pub fn get_daemon_pid() -> Option<u32> {
    read_live_pid(&get_pid_file_path())
}

/// Reads the PID stored at `path` if that process is alive, cleaning up a
/// stale file otherwise.
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let Ok(pid) = contents.trim().parse::<u32>() else {
        cleanup_stale_pid_file(path);
        return None;
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Writes the current process id to `path`, creating parent directories.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Removes the PID file if it still names this process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        == Some(std::process::id());
    if ours {
        cleanup_stale_pid_file(path);
    }
}

/// Check if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        i32::try_from(pid)
            .map(|pid| kill(Pid::from_raw(pid), None).is_ok())
            .unwrap_or(false)
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
