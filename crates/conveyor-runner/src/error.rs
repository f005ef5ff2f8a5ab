//! Supervisor errors.

use conveyor_core::Stage;
use conveyor_core::status::ErrorEnvelope;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The PID file could not be created. Fatal before any task runs.
    #[error("failed to write runner PID file {path}: {source}")]
    PidWriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("task module path must be absolute: {0}")]
    ModulePathInvalid(PathBuf),

    #[error("no handlers registered for task {0:?}")]
    UnknownTask(String),

    /// A task failed beyond recovery; the working directory is retained for
    /// inspection.
    #[error("task {task:?} failed in stage {stage}")]
    TaskFailed {
        task: String,
        stage: Stage,
        envelope: Box<ErrorEnvelope>,
    },

    #[error("job {0:?} already exists")]
    JobExists(String),

    #[error(transparent)]
    State(#[from] conveyor_state::StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;
