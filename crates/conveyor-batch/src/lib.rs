//! Batch sub-runner for conveyor.
//!
//! Processes a user-supplied list of jobs with a processor function,
//! concurrency capped, per-row retry-limited, crash-safe. State lives in a
//! job-local SQLite store (`run.db`) with WAL journaling; every status
//! change is persisted before a worker continues.

pub mod error;
pub mod runner;
pub mod store;

pub use error::{BatchError, BatchResult};
pub use runner::{
    BatchContext, BatchJobInput, BatchOptions, BatchOutcome, BatchProcessor, CompletedJob,
    FailedJob, execute_batch,
};
pub use store::{SqlitePool, ensure_schema, open_store};
