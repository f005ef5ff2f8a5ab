//! Durable state layer for conveyor.
//!
//! Two surfaces live here:
//! - [`StatusWriter`]: serialized, atomic read-modify-write of the per-job
//!   status document, FIFO-ordered per job directory.
//! - [`TaskIo`]: typed, task-scoped file writes that mirror every file name
//!   into the job-level and task-level inventories.

pub mod error;
pub mod files;
pub mod writer;

pub use error::{StateError, StateResult};
pub use files::{TaskIo, WriteMode};
pub use writer::{STATUS_FILE, StatusWriter, read_status, reconcile_inventory};
