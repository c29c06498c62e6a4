// SQLite HandleRepository Implementation

use async_trait::async_trait;
use qvisor_core::domain::{TaskRecord, TaskRecordState};
use qvisor_core::error::{AppError, Result};
use qvisor_core::port::HandleRepository;
use sqlx::SqlitePool;

// SQLite result codes: https://www.sqlite.org/rescode.html
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    let sqlx::Error::Database(db_err) = &err else {
        return AppError::Database(err.to_string());
    };
    match db_err.code().as_deref() {
        // SQLITE_CONSTRAINT_CHECK: a state outside RUNNING/EXITED/LOST
        Some("275") => AppError::Database(format!(
            "Rejected task record: {}",
            db_err.message()
        )),
        Some("5") => AppError::Database(format!(
            "Handle store locked (SQLITE_BUSY): {}",
            db_err.message()
        )),
        Some(code) => AppError::Database(format!("Database error [{}]: {}", code, db_err.message())),
        None => AppError::Database(format!("Database error: {}", db_err.message())),
    }
}

pub struct SqliteHandleRepository {
    pool: SqlitePool,
}

impl SqliteHandleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HandleRepository for SqliteHandleRepository {
    async fn upsert(&self, record: &TaskRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_handles (
                task_name, identity, state, exit_code, signal, error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_name) DO UPDATE SET
                identity = excluded.identity,
                state = excluded.state,
                exit_code = excluded.exit_code,
                signal = excluded.signal,
                error = excluded.error,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.task_name)
        .bind(&record.identity)
        .bind(record.state.to_string())
        .bind(record.exit_code)
        .bind(record.signal)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_by_name(&self, task_name: &str) -> Result<Option<TaskRecord>> {
        let row: Option<TaskHandleRow> =
            sqlx::query_as("SELECT * FROM task_handles WHERE task_name = ?")
                .bind(task_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        row.map(TaskHandleRow::into_record).transpose()
    }

    async fn find_by_state(&self, state: TaskRecordState) -> Result<Vec<TaskRecord>> {
        let rows: Vec<TaskHandleRow> = sqlx::query_as(
            r#"
            SELECT * FROM task_handles
            WHERE state = ?
            ORDER BY created_at ASC, task_name ASC
            "#,
        )
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(TaskHandleRow::into_record).collect()
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        let rows: Vec<TaskHandleRow> = sqlx::query_as(
            "SELECT * FROM task_handles ORDER BY created_at DESC, task_name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(TaskHandleRow::into_record).collect()
    }

    async fn delete(&self, task_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM task_handles WHERE task_name = ?")
            .bind(task_name)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct TaskHandleRow {
    task_name: String,
    identity: String,
    state: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskHandleRow {
    fn into_record(self) -> Result<TaskRecord> {
        Ok(TaskRecord {
            state: self.state.parse::<TaskRecordState>()?,
            task_name: self.task_name,
            identity: self.identity,
            exit_code: self.exit_code,
            signal: self.signal,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
