//! Embedded SQLite database handling.
//!
//! Wraps pool creation, pragmas and embedded migrations. Stores acquire
//! connections from the shared pool per operation; no cross-handler
//! transaction is ever held.

use std::path::{Path, PathBuf};

use sqlx::migrate::Migrator;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Pool, Sqlite, SqlitePool};
use tracing::info;

use crate::error::BridgeError;

/// Static migrator for embedded `SQLite` migrations.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Database configuration with connection pool settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    path: PathBuf,
    max_connections: u32,
    enable_wal_mode: bool,
}

impl DatabaseConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_connections: 10,
            enable_wal_mode: true,
        }
    }

    /// Single-connection config without WAL, for tests.
    pub fn for_testing(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_connections: 1,
            enable_wal_mode: false,
        }
    }

    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Database connection with managed pool.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
}

impl DatabaseConnection {
    /// Opens the pool, applies pragmas and runs embedded migrations.
    pub async fn initialize(config: DatabaseConfig) -> Result<Self, BridgeError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BridgeError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let mut options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .pragma("foreign_keys", "ON");
        if config.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = sqlx::pool::PoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| BridgeError::Database(sqlx::Error::Migrate(Box::new(e))))?;
        info!(path = %config.path.display(), "database migrations applied");

        Ok(Self { pool })
    }

    /// Access to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
