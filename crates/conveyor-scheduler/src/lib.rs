//! Stage scheduler for conveyor.
//!
//! Runs one task through the canonical stage list exactly once, subject to
//! skip predicates and the `{output, flags}` stage contract, while producing
//! structured run logs, durable status updates, and stage-local log sinks.

pub mod context;
pub mod error;
pub mod handler;
pub mod logger;
pub mod model;
pub mod scheduler;

pub use context::{StageContext, StageMeta, Validators};
pub use error::{SchedulerError, SchedulerResult};
pub use handler::{
    FnHandler, StageHandler, StagePlan, StageSpec, TaskHandlers, TaskRegistry, handler_fn,
};
pub use logger::StageLogger;
pub use model::{ModelBus, ModelEvent, ModelMetric};
pub use scheduler::{StageLogEntry, TaskFailure, TaskRunSpec, TaskScheduler, TaskSuccess};
