//! Lifecycle directory roots.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Roots of the three lifecycle directories. A job lives in exactly one of
/// them at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclePaths {
    pub current: PathBuf,
    pub complete: PathBuf,
    pub rejected: PathBuf,
}

impl LifecyclePaths {
    /// Read the roots from `CONVEYOR_CURRENT_DIR`, `CONVEYOR_COMPLETE_DIR`
    /// and `CONVEYOR_REJECTED_DIR`, defaulting to `./current`, `./complete`
    /// and `./rejected`.
    pub fn from_env() -> Self {
        Self {
            current: env_path("CONVEYOR_CURRENT_DIR", "current"),
            complete: env_path("CONVEYOR_COMPLETE_DIR", "complete"),
            rejected: env_path("CONVEYOR_REJECTED_DIR", "rejected"),
        }
    }

    /// Roots rooted under one base directory.
    pub fn under(base: &Path) -> Self {
        Self {
            current: base.join("current"),
            complete: base.join("complete"),
            rejected: base.join("rejected"),
        }
    }

    /// Working directory of a job in the current lifecycle dir.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.current.join(job_id)
    }

    /// Destination directory of a promoted job.
    pub fn completed_job_dir(&self, job_id: &str) -> PathBuf {
        self.complete.join(job_id)
    }

    /// The completed-jobs tail, one JSON line per promoted job.
    pub fn runs_log(&self) -> PathBuf {
        self.complete.join("runs.jsonl")
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}
