//! Batch runner errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    /// A supplied job id already has a terminal row with different input.
    #[error("terminal-state reinsert: job {id} in batch {batch_id} is already {status}")]
    TerminalStateReinsert {
        id: String,
        batch_id: String,
        status: String,
    },

    #[error("invalid batch options: {0}")]
    InvalidOptions(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type BatchResult<T> = std::result::Result<T, BatchError>;
