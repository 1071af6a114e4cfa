//! Launch command resolution and working directory validation.

use std::path::{Path, PathBuf};

use super::error::SessionError;
use super::types::SessionKind;

/// Claude flags forwarded to the agent binary.
const CLAUDE_FLAGS: &[&str] = &["--yolo", "--full-auto"];

/// Turns a session kind into the command line tmux runs.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    default_shell: String,
}

impl CommandResolver {
    pub fn new(default_shell: impl Into<String>) -> Self {
        Self {
            default_shell: default_shell.into(),
        }
    }

    /// Resolves the launch command for a new session in `workdir`.
    ///
    /// Agent kinds are looked up on PATH; a missing binary is reported as
    /// [`SessionError::DependencyMissing`].
    pub fn resolve(
        &self,
        kind: SessionKind,
        command: Option<&str>,
        flags: &[String],
        workdir: &Path,
    ) -> Result<String, SessionError> {
        match kind {
            SessionKind::Claude | SessionKind::Droid => {
                let binary = lookup(kind.as_str())?;
                Ok(agent_command(kind, &binary, flags, workdir))
            }
            SessionKind::Shell => Ok(command
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(&self.default_shell)
                .to_string()),
        }
    }
}

/// `claude [--yolo] [--full-auto] --workdir <dir>` or `droid <dir>`.
fn agent_command(kind: SessionKind, binary: &Path, flags: &[String], workdir: &Path) -> String {
    let mut parts = vec![quote(binary)];
    if kind == SessionKind::Claude {
        for flag in CLAUDE_FLAGS {
            if flags.iter().any(|f| f == flag) {
                parts.push((*flag).to_string());
            }
        }
        parts.push("--workdir".to_string());
    }
    parts.push(quote(workdir));
    parts.join(" ")
}

fn lookup(binary: &str) -> Result<PathBuf, SessionError> {
    which::which(binary)
        .map_err(|_| SessionError::DependencyMissing(format!("{} not found in PATH", binary)))
}

/// Single-quotes a path that contains whitespace.
fn quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if raw.chars().any(char::is_whitespace) {
        format!("'{}'", raw.replace('\'', r"'\''"))
    } else {
        raw.into_owned()
    }
}

/// Checks that `path` is an absolute, existing directory inside one of
/// `allowed_roots` (any directory when the list is empty).
pub fn validate_workdir(path: &Path, allowed_roots: &[PathBuf]) -> Result<PathBuf, SessionError> {
    let invalid = |reason: &str| SessionError::InvalidWorkdir {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    if !path.is_absolute() {
        return Err(invalid("must be an absolute path"));
    }
    let canonical = path
        .canonicalize()
        .map_err(|e| invalid(&format!("cannot access directory: {}", e)))?;
    if !canonical.is_dir() {
        return Err(invalid("not a directory"));
    }

    if allowed_roots.is_empty() {
        return Ok(canonical);
    }
    let permitted = allowed_roots.iter().any(|root| {
        root.canonicalize()
            .map(|root| canonical.starts_with(root))
            .unwrap_or(false)
    });
    if permitted {
        Ok(canonical)
    } else {
        Err(invalid("outside the allowed workdir roots"))
    }
}
