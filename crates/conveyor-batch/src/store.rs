//! The job-local durable store.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;

use crate::BatchResult;

pub use sqlx::SqlitePool;

/// A row of the `batch_jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatchJobRow {
    pub id: String,
    pub batch_id: String,
    pub status: String,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Open (creating if necessary) the store file with WAL journaling.
pub async fn open_store(path: &Path) -> BatchResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create the schema. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> BatchResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_jobs (
          id TEXT PRIMARY KEY,
          batch_id TEXT NOT NULL,
          status TEXT NOT NULL DEFAULT 'pending',
          input TEXT NOT NULL,
          output TEXT,
          error TEXT,
          retry_count INTEGER NOT NULL DEFAULT 0,
          started_at TEXT,
          completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_batch_jobs_batch_status ON batch_jobs(batch_id, status)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Reset crash-stale `processing` rows of a batch back to `pending`.
pub async fn reset_stale_processing(pool: &SqlitePool, batch_id: &str) -> BatchResult<u64> {
    let result = sqlx::query(
        "UPDATE batch_jobs SET status = 'pending', started_at = NULL \
         WHERE batch_id = ? AND status = 'processing'",
    )
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Rows of a batch eligible for dispatch, ordered by id.
pub async fn eligible_rows(
    pool: &SqlitePool,
    batch_id: &str,
    max_retries: u32,
) -> BatchResult<Vec<BatchJobRow>> {
    let rows = sqlx::query_as::<_, BatchJobRow>(
        "SELECT * FROM batch_jobs \
         WHERE batch_id = ? AND status IN ('pending', 'failed') AND retry_count < ? \
         ORDER BY id",
    )
    .bind(batch_id)
    .bind(max_retries as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Rows of a batch in the given status, ordered by id.
pub async fn rows_in_status(
    pool: &SqlitePool,
    batch_id: &str,
    status: &str,
) -> BatchResult<Vec<BatchJobRow>> {
    let rows = sqlx::query_as::<_, BatchJobRow>(
        "SELECT * FROM batch_jobs WHERE batch_id = ? AND status = ? ORDER BY id",
    )
    .bind(batch_id)
    .bind(status)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Mark a row as claimed by a worker.
pub async fn mark_processing(pool: &SqlitePool, batch_id: &str, id: &str) -> BatchResult<()> {
    sqlx::query(
        "UPDATE batch_jobs SET status = 'processing', started_at = ? \
         WHERE batch_id = ? AND id = ?",
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(batch_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a row as completed with its serialized output.
pub async fn mark_complete(
    pool: &SqlitePool,
    batch_id: &str,
    id: &str,
    output: &str,
) -> BatchResult<()> {
    sqlx::query(
        "UPDATE batch_jobs SET status = 'complete', output = ?, completed_at = ? \
         WHERE batch_id = ? AND id = ?",
    )
    .bind(output)
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(batch_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a processor failure, incrementing the retry count. Once the count
/// reaches `max_retries` the row is stored as `permanently_failed` and never
/// leaves that status.
pub async fn mark_failed(
    pool: &SqlitePool,
    batch_id: &str,
    id: &str,
    error: &str,
    max_retries: u32,
) -> BatchResult<()> {
    sqlx::query(
        "UPDATE batch_jobs SET \
           retry_count = retry_count + 1, \
           status = CASE WHEN retry_count + 1 >= ? THEN 'permanently_failed' ELSE 'failed' END, \
           error = ? \
         WHERE batch_id = ? AND id = ?",
    )
    .bind(max_retries as i64)
    .bind(error)
    .bind(batch_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
