//! SQLite-backed session record store.
//!
//! Records live in a single `sessions` table. Schema versions are tracked
//! with `PRAGMA user_version`. All statements run on the blocking pool
//! against one shared connection.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::session::store::{SessionStore, StoreError};
use crate::session::types::{Session, SessionPatch};

const SESSION_COLUMNS: &str = "id, name, type, workdir, channel_address, command, flags, \
     pid, status, exit_code, cols, rows, created_at, updated_at";

/// [`SessionStore`] persisted in a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates the database at `path`, applying pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "Opened session database");
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Current schema version.
    pub async fn schema_version(&self) -> Result<i32, StoreError> {
        self.call(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
            .await
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

fn migrate_v1(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            workdir TEXT NOT NULL,
            channel_address TEXT NOT NULL,
            command TEXT NOT NULL,
            flags TEXT NOT NULL DEFAULT '[]',
            pid INTEGER,
            status TEXT NOT NULL,
            exit_code INTEGER,
            cols INTEGER NOT NULL,
            rows INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
        [],
    )?;
    tx.execute("PRAGMA user_version = 1", [])?;
    tx.commit()?;
    tracing::debug!("Applied session schema migration v1");
    Ok(())
}

/// Column values as read, before validation.
struct RawRow {
    id: String,
    name: String,
    kind: String,
    workdir: String,
    channel_address: String,
    command: String,
    flags: String,
    pid: Option<i64>,
    status: String,
    exit_code: Option<i32>,
    cols: i64,
    rows: i64,
    created_at: i64,
    updated_at: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            workdir: row.get(3)?,
            channel_address: row.get(4)?,
            command: row.get(5)?,
            flags: row.get(6)?,
            pid: row.get(7)?,
            status: row.get(8)?,
            exit_code: row.get(9)?,
            cols: row.get(10)?,
            rows: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_session(self) -> Result<Session, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };

        let kind = self.kind.parse().map_err(|e| corrupt(format!("{}", e)))?;
        let status = self.status.parse().map_err(|e| corrupt(format!("{}", e)))?;
        let flags: Vec<String> =
            serde_json::from_str(&self.flags).map_err(|e| corrupt(format!("flags: {}", e)))?;
        let cols = u16::try_from(self.cols).map_err(|_| corrupt(format!("cols {}", self.cols)))?;
        let rows = u16::try_from(self.rows).map_err(|_| corrupt(format!("rows {}", self.rows)))?;
        let pid = self.pid.and_then(|p| u32::try_from(p).ok());
        let created_at = millis_to_time(self.created_at)
            .ok_or_else(|| corrupt(format!("created_at {}", self.created_at)))?;
        let updated_at = millis_to_time(self.updated_at)
            .ok_or_else(|| corrupt(format!("updated_at {}", self.updated_at)))?;

        Ok(Session {
            name: self.name.clone(),
            workdir: PathBuf::from(&self.workdir),
            channel_address: PathBuf::from(&self.channel_address),
            command: self.command.clone(),
            exit_code: self.exit_code,
            id: self.id,
            kind,
            flags,
            status,
            pid,
            cols,
            rows,
            created_at,
            updated_at,
        })
    }
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn select_one(conn: &Connection, id: &str) -> Result<Option<Session>, StoreError> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
    conn.query_row(&sql, params![id], RawRow::from_row)
        .optional()?
        .map(RawRow::into_session)
        .transpose()
}

/// Conversion failures local to one row, as opposed to database failures.
fn is_column_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
    )
}

fn encode_flags(flags: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(flags).map_err(|e| StoreError::Task(format!("encode flags: {}", e)))
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn select(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let id = id.to_string();
        self.call(move |conn| select_one(conn, &id)).await
    }

    async fn select_all(&self) -> Result<Vec<Session>, StoreError> {
        self.call(|conn| {
            let sql = format!(
                "SELECT {} FROM sessions ORDER BY created_at ASC",
                SESSION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut sessions = Vec::new();
            for row in stmt.query_map([], RawRow::from_row)? {
                let raw = match row {
                    Ok(raw) => raw,
                    Err(err) if is_column_error(&err) => {
                        tracing::warn!(error = %err, "Skipping unreadable session row");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                match raw.into_session() {
                    Ok(session) => sessions.push(session),
                    Err(err) => tracing::warn!(error = %err, "Skipping unreadable session row"),
                }
            }
            Ok(sessions)
        })
        .await
    }

    async fn insert(&self, session: &Session) -> Result<(), StoreError> {
        let session = session.clone();
        self.call(move |conn| {
            let flags = encode_flags(&session.flags)?;
            let sql = format!(
                "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                SESSION_COLUMNS
            );
            let result = conn.execute(
                &sql,
                params![
                    session.id,
                    session.name,
                    session.kind.as_str(),
                    session.workdir.to_string_lossy().into_owned(),
                    session.channel_address.to_string_lossy().into_owned(),
                    session.command,
                    flags,
                    session.pid,
                    session.status.as_str(),
                    session.exit_code,
                    session.cols,
                    session.rows,
                    session.created_at.timestamp_millis(),
                    session.updated_at.timestamp_millis(),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Duplicate(session.id.clone()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update(&self, id: &str, patch: &SessionPatch) -> Result<(), StoreError> {
        let id = id.to_string();
        let patch = patch.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut session =
                select_one(&tx, &id)?.ok_or_else(|| StoreError::Missing(id.clone()))?;
            session.apply(&patch);

            let flags = encode_flags(&session.flags)?;
            tx.execute(
                "UPDATE sessions SET name = ?2, type = ?3, workdir = ?4, channel_address = ?5, \
                 command = ?6, flags = ?7, pid = ?8, status = ?9, exit_code = ?10, cols = ?11, \
                 rows = ?12, updated_at = ?13 WHERE id = ?1",
                params![
                    session.id,
                    session.name,
                    session.kind.as_str(),
                    session.workdir.to_string_lossy().into_owned(),
                    session.channel_address.to_string_lossy().into_owned(),
                    session.command,
                    flags,
                    session.pid,
                    session.status.as_str(),
                    session.exit_code,
                    session.cols,
                    session.rows,
                    session.updated_at.timestamp_millis(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
