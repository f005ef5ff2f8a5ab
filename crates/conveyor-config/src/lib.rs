//! KDL configuration parsing for conveyor.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (pipeline.kdl)
//! - Lifecycle directory roots from the environment

pub mod error;
pub mod pipeline;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{Pipeline, TaskSpec, load_pipeline, parse_pipeline};
pub use system::LifecyclePaths;
