//! Scheduler errors.
//!
//! Every variant except `State` is fatal to the task it occurs in; none are
//! retried at the stage level.

use conveyor_core::Stage;
use conveyor_core::flags::FlagType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Handler returned something other than `{output, flags}`.
    #[error("stage contract violation in {stage}: {message}")]
    ContractViolation { stage: Stage, message: String },

    /// A produced flag would change an existing flag's variant tag.
    #[error("flag type conflict on {key:?} in {stage}: existing {existing}, produced {produced}")]
    FlagTypeConflict {
        stage: Stage,
        key: String,
        existing: FlagType,
        produced: FlagType,
    },

    #[error("prerequisite flag {key:?} missing for stage {stage}")]
    PrerequisiteFlagMissing { stage: Stage, key: String },

    #[error("prerequisite flag {key:?} for stage {stage} is {actual}, expected {expected}")]
    PrerequisiteFlagTypeMismatch {
        stage: Stage,
        key: String,
        expected: FlagType,
        actual: FlagType,
    },

    /// User code raised inside a handler.
    #[error("stage handler failed in {stage}: {message}")]
    Handler {
        stage: Stage,
        message: String,
        stack: Option<String>,
    },

    #[error(transparent)]
    State(#[from] conveyor_state::StateError),
}

impl SchedulerError {
    /// Error-kind name recorded in the normalized envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::ContractViolation { .. } => "StageContractViolation",
            SchedulerError::FlagTypeConflict { .. } => "FlagTypeConflict",
            SchedulerError::PrerequisiteFlagMissing { .. } => "PrerequisiteFlagMissing",
            SchedulerError::PrerequisiteFlagTypeMismatch { .. } => "PrerequisiteFlagTypeMismatch",
            SchedulerError::Handler { .. } => "StageHandlerError",
            SchedulerError::State(_) => "StatusWriteFailed",
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
