//! The batch execution loop.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BatchError, BatchResult};
use crate::store::{self, SqlitePool};

/// One job supplied to [`execute_batch`].
#[derive(Debug, Clone)]
pub struct BatchJobInput {
    pub id: String,
    pub input: Value,
}

impl BatchJobInput {
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }
}

/// Options for one batch invocation.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum number of concurrently running workers.
    pub concurrency: usize,
    /// Upper bound on processing attempts per row.
    pub max_retries: u32,
    /// Batch identifier; freshly generated when absent.
    pub batch_id: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retries: 3,
            batch_id: None,
        }
    }
}

/// Context handed to the processor alongside each job's input.
#[derive(Clone)]
pub struct BatchContext {
    /// 1-based attempt number for this row.
    pub attempt: u32,
    pub batch_id: String,
    /// The shared store, for processors that keep their own tables.
    pub pool: SqlitePool,
}

/// User-supplied per-job processor.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, input: Value, ctx: BatchContext) -> anyhow::Result<Value>;
}

/// A row that reached `complete`.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub id: String,
    pub input: Value,
    pub output: Value,
}

/// A row that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub id: String,
    pub input: Value,
    pub error: String,
    pub retry_count: u32,
}

/// Result of one batch invocation.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub completed: Vec<CompletedJob>,
    pub failed: Vec<FailedJob>,
}

/// Process `jobs` through `processor`, bounded by `options.concurrency`.
///
/// Crash-stale `processing` rows of the batch are reset to `pending` before
/// any worker is dispatched. Re-invoking with the same batch id and jobs is
/// idempotent: terminal rows are reported again without being re-processed.
pub async fn execute_batch(
    pool: &SqlitePool,
    jobs: Vec<BatchJobInput>,
    processor: Arc<dyn BatchProcessor>,
    options: BatchOptions,
) -> BatchResult<BatchOutcome> {
    if options.concurrency == 0 {
        return Err(BatchError::InvalidOptions(
            "concurrency must be at least 1".to_string(),
        ));
    }
    let batch_id = options
        .batch_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    store::ensure_schema(pool).await?;

    let reset = store::reset_stale_processing(pool, &batch_id).await?;
    if reset > 0 {
        warn!(batch_id = %batch_id, rows = reset, "Reset crash-stale processing rows");
    }

    insert_jobs(pool, &batch_id, &jobs).await?;

    info!(batch_id = %batch_id, jobs = jobs.len(), concurrency = options.concurrency, "Starting batch");

    let semaphore = Arc::new(Semaphore::new(options.concurrency));
    loop {
        let rows = store::eligible_rows(pool, &batch_id, options.max_retries).await?;
        if rows.is_empty() {
            break;
        }

        let mut workers = JoinSet::new();
        for row in rows {
            let semaphore = semaphore.clone();
            let pool = pool.clone();
            let processor = processor.clone();
            let batch_id = batch_id.clone();
            let max_retries = options.max_retries;
            workers.spawn(async move {
                // The semaphore is never closed while workers hold a clone.
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                run_one(&pool, &batch_id, &row.id, &row.input, row.retry_count, max_retries, processor).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            joined??;
        }
    }

    let completed = store::rows_in_status(pool, &batch_id, "complete")
        .await?
        .into_iter()
        .map(|row| {
            Ok(CompletedJob {
                id: row.id,
                input: serde_json::from_str(&row.input)?,
                output: row
                    .output
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or(Value::Null),
            })
        })
        .collect::<BatchResult<Vec<_>>>()?;

    let failed = store::rows_in_status(pool, &batch_id, "permanently_failed")
        .await?
        .into_iter()
        .map(|row| {
            Ok(FailedJob {
                id: row.id,
                input: serde_json::from_str(&row.input)?,
                error: row.error.unwrap_or_default(),
                retry_count: row.retry_count as u32,
            })
        })
        .collect::<BatchResult<Vec<_>>>()?;

    info!(batch_id = %batch_id, completed = completed.len(), failed = failed.len(), "Batch finished");

    Ok(BatchOutcome {
        batch_id,
        completed,
        failed,
    })
}

/// Insert the supplied jobs as `pending` in one transaction.
///
/// A pre-existing non-terminal row is left in place. A pre-existing terminal
/// row with identical input is also left in place, so re-invocation is
/// idempotent; with different input the insert fails loudly.
async fn insert_jobs(
    pool: &SqlitePool,
    batch_id: &str,
    jobs: &[BatchJobInput],
) -> BatchResult<()> {
    let mut tx = pool.begin().await?;

    for job in jobs {
        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT status, input FROM batch_jobs WHERE batch_id = ? AND id = ?",
        )
        .bind(batch_id)
        .bind(&job.id)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some((status, stored_input))
                if status == "complete" || status == "permanently_failed" =>
            {
                let stored: Value = serde_json::from_str(&stored_input)?;
                if stored != job.input {
                    return Err(BatchError::TerminalStateReinsert {
                        id: job.id.clone(),
                        batch_id: batch_id.to_string(),
                        status,
                    });
                }
                debug!(batch_id = %batch_id, id = %job.id, "Terminal row left untouched");
            }
            Some(_) => {
                debug!(batch_id = %batch_id, id = %job.id, "Row already queued");
            }
            None => {
                sqlx::query(
                    "INSERT OR IGNORE INTO batch_jobs (id, batch_id, status, input) \
                     VALUES (?, ?, 'pending', ?)",
                )
                .bind(&job.id)
                .bind(batch_id)
                .bind(serde_json::to_string(&job.input)?)
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    tx.commit().await?;
    Ok(())
}

async fn run_one(
    pool: &SqlitePool,
    batch_id: &str,
    id: &str,
    input: &str,
    retry_count: i64,
    max_retries: u32,
    processor: Arc<dyn BatchProcessor>,
) -> BatchResult<()> {
    store::mark_processing(pool, batch_id, id).await?;

    let input_value: Value = serde_json::from_str(input)?;
    let ctx = BatchContext {
        attempt: retry_count as u32 + 1,
        batch_id: batch_id.to_string(),
        pool: pool.clone(),
    };

    match processor.process(input_value, ctx).await {
        Ok(output) => {
            store::mark_complete(pool, batch_id, id, &serde_json::to_string(&output)?).await?;
            debug!(batch_id = %batch_id, id = %id, "Job complete");
        }
        Err(error) => {
            let message = format!("{error:#}");
            warn!(batch_id = %batch_id, id = %id, error = %message, "Job failed");
            store::mark_failed(pool, batch_id, id, &message, max_retries).await?;
        }
    }
    Ok(())
}
