//! `SQLite` plumbing for the relay's registry and job tables.
//!
//! Several relay instances may share one database file, so pools run in WAL
//! mode with a busy timeout, and a write that still loses the race surfaces
//! as [`DatabaseError::Busy`] rather than a generic query failure.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// File name of the relay database inside the data directory.
pub const DB_FILE: &str = "relay.db";

/// `SQLite` primary and extended result codes meaning "locked by another
/// connection".
const BUSY_CODES: &[&str] = &["5", "6", "261", "517"];

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db)
                if db.code().is_some_and(|code| BUSY_CODES.contains(&code.as_ref())) =>
            {
                Self::Busy(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut => Self::Busy("connection pool exhausted".to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Pool sizing and lock waiting for a file-backed database.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// How long a statement waits on another connection's write lock.
    pub busy_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Path of the relay database inside `data_dir`.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE)
}

/// Open (or create) the database at `path`, creating missing parent
/// directories.
pub async fn open_pool(path: &Path, settings: &PoolSettings) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DatabaseError::Io(format!("{}: {e}", parent.display())))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(settings.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .acquire_timeout(settings.busy_timeout)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    info!(path = %path.display(), max_connections = settings.max_connections, "Database opened");
    Ok(pool)
}

/// Single-connection in-memory database, so every query sees the same
/// schema.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Define a database handle that owns a pool and applies the invoking
/// crate's `./migrations` on open.
///
/// ```ignore
/// netgate_core::define_database!(RelayDatabase);
/// let db = RelayDatabase::open_in(&data_dir).await?;
/// ```
#[macro_export]
macro_rules! define_database {
    ($name:ident) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            /// Open the database file inside `data_dir`.
            pub async fn open_in(
                data_dir: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::open(&$crate::db::db_path(data_dir), &$crate::db::PoolSettings::default())
                    .await
            }

            pub async fn open(
                path: &::std::path::Path,
                settings: &$crate::db::PoolSettings,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::migrated($crate::db::open_pool(path, settings).await?).await
            }

            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                Self::migrated($crate::db::open_pool_in_memory().await?).await
            }

            async fn migrated(
                pool: ::sqlx::Pool<::sqlx::Sqlite>,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;
                ::tracing::debug!(database = stringify!($name), "Migrations applied");
                Ok(Self { pool })
            }

            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}
