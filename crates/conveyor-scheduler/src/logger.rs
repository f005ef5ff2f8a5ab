//! Stage-scoped log sinks.
//!
//! Handlers do not write to ambient stdout/stderr; each stage hands its
//! handler an explicit logger bound to `files/logs/stage-<stage>.log`. The
//! sink is released when the last clone drops, which the scheduler
//! guarantees on every exit path.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Append-only sink for one stage's captured console output.
#[derive(Clone)]
pub struct StageLogger {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    // None when the sink could not be opened; writes become no-ops so a
    // logging problem never fails a handler.
    file: Mutex<Option<File>>,
}

impl StageLogger {
    /// Open a sink at `path`, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = open_append(&path);
        if file.is_none() {
            warn!(path = %path.display(), "Stage log sink could not be opened");
        }
        Self {
            inner: Arc::new(Inner {
                path,
                file: Mutex::new(file),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn info(&self, message: &str) {
        self.write_line("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.write_line("WARN", message);
    }

    pub fn debug(&self, message: &str) {
        self.write_line("DEBUG", message);
    }

    pub fn error(&self, message: &str) {
        self.write_line("ERROR", message);
    }

    fn write_line(&self, level: &str, message: &str) {
        let mut guard = self
            .inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = guard.as_mut() {
            let line = format!("[{}] {level} {message}\n", Utc::now().to_rfc3339());
            if file.write_all(line.as_bytes()).is_err() {
                // Disable the sink after the first write failure.
                *guard = None;
                warn!(path = %self.inner.path.display(), "Stage log sink write failed");
            }
        }
    }
}

fn open_append(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    OpenOptions::new().append(true).create(true).open(path).ok()
}
