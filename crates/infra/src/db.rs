//! SQLite database handle: connection pool, pragmas and migrations.
//!
//! All job and auth state lives in one SQLite database. Connections are opened
//! in WAL mode with a busy timeout and with foreign keys enforced.
//!
//! Write transactions start with `BEGIN IMMEDIATE`. A deferred transaction
//! that reads before it writes cannot wait for a competing writer: SQLite
//! fails its lock upgrade with `SQLITE_BUSY` without consulting the busy
//! timeout. Taking the write lock up front makes writers queue instead.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{info, instrument};

/// Connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// File path (`app.db`) or SQLite URL (`sqlite://app.db`, `sqlite::memory:`).
    pub url: String,
    pub max_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    /// How long a connection waits for a competing writer before giving up.
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "app.db".to_string(),
            max_connections: 5,
            max_lifetime: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("error connecting to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("error migrating database: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Shared database handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    #[instrument(skip(config), fields(url = %config.url), err)]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let options = if config.url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(&config.url).map_err(DatabaseError::Connect)?
        } else {
            SqliteConnectOptions::new().filename(&config.url)
        };
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        info!(
            max_connections = config.max_connections,
            max_lifetime = ?config.max_lifetime,
            idle_timeout = ?config.idle_timeout,
            "connecting to database"
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .max_lifetime(Some(config.max_lifetime))
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(options)
            .await
            .map_err(DatabaseError::Connect)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations from `crates/infra/migrations`.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a unit of work. Dropping the transaction without committing rolls
    /// it back, together with any jobs enqueued into it.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        begin_write(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Start a transaction holding the database write lock.
pub(crate) async fn begin_write(
    pool: &SqlitePool,
) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}

/// Decode a stored Unix-millisecond timestamp.
pub(crate) fn timestamp_from_millis(column: &str, millis: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| format!("{column} timestamp {millis} is out of range"))
}
