//! The runner PID file.

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{RunnerError, RunnerResult};

/// Guard over `<workDir>/runner.pid`.
///
/// The file holds this process's PID while a supervisor is running and is
/// removed best-effort on drop, which covers normal completion, task
/// failure, and cancellation by signal handling that drops the run future.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: impl Into<PathBuf>) -> RunnerResult<Self> {
        let path = path.into();
        std::fs::write(&path, std::process::id().to_string()).map_err(|source| {
            RunnerError::PidWriteFailed {
                path: path.clone(),
                source,
            }
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit removal, used before the job directory is renamed away.
    pub fn remove(&self) {
        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %error, "PID file not removed");
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_pid_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.pid");

        let pid = PidFile::create(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());

        drop(pid);
        assert!(!path.exists());
    }

    #[test]
    fn create_fails_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = PidFile::create(dir.path().join("gone").join("runner.pid")).unwrap_err();
        assert!(matches!(err, RunnerError::PidWriteFailed { .. }));
    }
}
