//! SQLite pool creation and pragma tuning.

use sqlx::ConnectOptions;
use tracing::info;

use crate::error::{DbError, Result};

/// Pool type alias, kept so callers don't depend on `sqlx::sqlite` directly.
pub type DbPool = sqlx::SqlitePool;

/// Connection configuration for the KrakenHashes control-plane database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// `sqlite:<path>?mode=rwc` or `sqlite::memory:`.
    pub url: String,
    pub max_connections: u32,
}

impl DbConfig {
    /// On-disk database at `path`, created if missing.
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            max_connections: 5,
        }
    }

    /// In-memory database, for tests.
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Open a pool against `config` with WAL-mode, busy-timeout, and
/// foreign-key pragmas applied to every pooled connection (not just the one
/// that happens to run a one-off `PRAGMA` query), then run the embedded
/// schema migration.
pub async fn create_pool(config: DbConfig) -> Result<DbPool> {
    let connect_options: sqlx::sqlite::SqliteConnectOptions = config
        .url
        .parse()
        .map_err(|e| DbError::InvalidInput(format!("invalid database url: {e}")))?;
    let connect_options = connect_options
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_millis(5_000))
        .create_if_missing(true)
        .disable_statement_logging();

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(connect_options)
        .await
        .map_err(DbError::Sqlx)?;

    crate::schema::ensure_schema(&pool).await?;

    info!("connected to sqlite database");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pool_opens_and_migrates() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
