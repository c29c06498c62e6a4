// Migration Runner
//
// Migrations are applied in order, each in its own transaction together with
// its schema_version row. A database newer than this binary is refused.

use qvisor_core::error::{AppError, Result};
use sqlx::SqlitePool;
use tracing::info;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "task handle store",
    sql: include_str!("../migrations/001_task_handles.sql"),
}];

fn db_error(e: sqlx::Error) -> AppError {
    AppError::Database(e.to_string())
}

/// Bring the handle store schema up to date
///
/// # Errors
/// - AppError::Database if a statement fails or the schema is from a newer qvisor
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(db_error)?;

    let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(db_error)?;
    let latest = MIGRATIONS.last().map_or(0, |m| m.version);

    if current > latest {
        return Err(AppError::Database(format!(
            "handle store schema v{} is newer than this binary supports (v{})",
            current, latest
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        info!(version = %migration.version, name = %migration.name, "Applying migration");
        apply(pool, migration).await?;
    }

    info!(version = %latest, "Handle store schema up to date");
    Ok(())
}

async fn apply(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    let mut tx = pool.begin().await.map_err(db_error)?;

    for statement in statements(migration.sql) {
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
    }

    sqlx::query(
        "INSERT INTO schema_version (version, applied_at)
         VALUES (?, CAST(strftime('%s', 'now') AS INTEGER) * 1000)",
    )
    .bind(migration.version)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)
}

/// Split a migration file into statements, dropping `--` comment lines
fn statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|chunk| {
            chunk
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;

    async fn pool(dir: &tempfile::TempDir) -> SqlitePool {
        create_pool(dir.path().join("state.db").to_str().unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn test_statements_skip_comments() {
        let sql = "-- header\nCREATE TABLE a (x INTEGER);\n\n-- note\nCREATE INDEX i ON a(x);\n";
        assert_eq!(
            statements(sql),
            vec!["CREATE TABLE a (x INTEGER)", "CREATE INDEX i ON a(x)"]
        );
    }

    #[tokio::test]
    async fn test_run_migrations_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir).await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_handles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(versions, vec![1]);
    }

    #[tokio::test]
    async fn test_newer_schema_refused() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir).await;
        run_migrations(&pool).await.unwrap();

        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (99, 0)")
            .execute(&pool)
            .await
            .unwrap();

        let err = run_migrations(&pool).await.unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
    }
}
