//! State layer errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("status document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] conveyor_core::Error),

    #[error("batch error: {0}")]
    Batch(#[from] conveyor_batch::BatchError),
}

pub type StateResult<T> = std::result::Result<T, StateError>;
