// SQLite Connection Pool Setup

use qvisor_core::error::{AppError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Create SQLite connection pool with WAL mode
///
/// `database_url` is either a `sqlite:` URL or a plain file path.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = if database_url.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(database_url).map_err(|e| {
            AppError::Database(format!("Invalid database URL {}: {}", database_url, e))
        })?
    } else {
        SqliteConnectOptions::new().filename(database_url)
    };

    let options = options
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| AppError::Database(e.to_string()))
}
