//! Connection bootstrap, schema migrations and error mapping.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long a writer waits on another connection's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/0001_init.sql"),
}];

#[derive(Error, Debug)]
pub enum StoreError {
    /// The database cannot currently be reached (closed, locked past the
    /// busy timeout, I/O failure). Callers may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
    #[error("database schema version {found} is newer than supported {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull,
            ) => Self::Unavailable(e.to_string()),
            _ => Self::Sqlite(e),
        }
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::Rusqlite(e) => e.into(),
            tokio_rusqlite::Error::ConnectionClosed => Self::Unavailable("connection closed".into()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

pub(crate) fn is_constraint_violation(e: &StoreError) -> bool {
    matches!(e, StoreError::Sqlite(inner) if inner.sqlite_error_code() == Some(ErrorCode::ConstraintViolation))
}

/// Handle to the rollcall database. Cheap to clone; all clones share one
/// background connection thread.
///
/// Independent `Store`s opened on the same file (another session, a backfill
/// job) are safe to use concurrently: uniqueness is enforced by the schema.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (creating if needed) a database file and apply pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let started = Instant::now();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = tokio_rusqlite::Connection::open(&path).await?;
        let store = Self { conn };
        store.bootstrap(true).await?;
        tracing::info!(
            path = %path.display(),
            duration_ms = started.elapsed().as_millis() as u64,
            "opened attendance store"
        );
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.bootstrap(false).await?;
        tracing::debug!("opened in-memory attendance store");
        Ok(store)
    }

    /// Close the underlying connection. Other clones observe
    /// [`StoreError::Unavailable`] afterwards.
    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(self.conn.call(|conn| Ok(current_user_version(conn)?)).await?)
    }

    async fn bootstrap(&self, wal: bool) -> Result<(), StoreError> {
        let found = self
            .conn
            .call(move |conn| {
                conn.busy_timeout(BUSY_TIMEOUT)?;
                if wal {
                    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                }
                Ok(apply_migrations(conn)?)
            })
            .await?;
        match found {
            MigrationStatus::UpToDate(version) | MigrationStatus::Migrated(version) => {
                tracing::debug!(version, "schema ready");
                Ok(())
            }
            MigrationStatus::TooNew(found) => Err(StoreError::UnsupportedSchema {
                found,
                supported: latest_version(),
            }),
        }
    }
}

enum MigrationStatus {
    UpToDate(u32),
    Migrated(u32),
    TooNew(u32),
}

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

fn apply_migrations(conn: &mut Connection) -> rusqlite::Result<MigrationStatus> {
    let current = current_user_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Ok(MigrationStatus::TooNew(current));
    }
    if current == latest {
        return Ok(MigrationStatus::UpToDate(current));
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tx.execute_batch(migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
    }
    tx.commit()?;
    Ok(MigrationStatus::Migrated(latest))
}

fn current_user_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))
}

/// Fixed-width RFC 3339 with nanoseconds: round-trips exactly and sorts
/// lexicographically in time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(value: &str, field: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("{field} {value:?}: {e}")))
}
