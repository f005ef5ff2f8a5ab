//! Error types shared across the workspace.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log name: {0}")]
    InvalidLogName(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
