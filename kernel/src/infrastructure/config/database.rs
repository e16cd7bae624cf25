//! Database configuration for the barrier kernel.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Database connection settings.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    /// Database connection URL.
    pub url: SecretString,
    /// Pool size (default: 8)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a statement waits on a locked database, in milliseconds
    /// (default: 5000)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseSettings {
    /// Opens a pool with WAL journaling and the configured busy timeout,
    /// creating the database file if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the database cannot be opened.
    pub async fn connect(&self) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(self.url.expose_secret())?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms));

        SqlitePoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .connect_with(options)
            .await
    }
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}
