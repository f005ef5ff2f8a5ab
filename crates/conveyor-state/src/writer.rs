//! Serialized status-document writer.
//!
//! All mutations of a job's `tasks-status.json` go through one
//! [`StatusWriter`]. Updates targeting the same job directory are ordered by
//! enqueue time through a per-job fair mutex; updates for different jobs
//! proceed in parallel. Each write replaces the whole file atomically via a
//! sibling temp file and rename.
//!
//! Concurrent mutation across processes is not supported: the engine assumes
//! a single writer per job.

use chrono::Utc;
use conveyor_core::status::{FileType, StatusDocument};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::StateResult;

/// File name of the status document inside a job directory.
pub const STATUS_FILE: &str = "tasks-status.json";

/// Serialized read-modify-write access to per-job status documents.
#[derive(Default)]
pub struct StatusWriter {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl StatusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, job_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(job_dir.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Apply `mutate` to the job's status document and persist the result.
    ///
    /// A missing or unparseable document reads as the empty default. Returns
    /// the snapshot that was written.
    pub async fn update<F>(&self, job_dir: &Path, mutate: F) -> StateResult<StatusDocument>
    where
        F: FnOnce(&mut StatusDocument),
    {
        let lock = self.lock_for(job_dir);
        // Tokio's mutex is fair, so queued updates run in enqueue order.
        let _guard = lock.lock().await;

        let path = job_dir.join(STATUS_FILE);
        let mut doc = read_status(&path).await;
        mutate(&mut doc);
        doc.last_updated = Some(Utc::now());

        let serialized = serde_json::to_string_pretty(&doc)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "Status document written");
        Ok(doc)
    }

    /// Blocking variant of [`StatusWriter::update`].
    ///
    /// Bypasses the per-job queue; reserved for supervisor fatal-exit paths
    /// where the runtime may be unwinding and no concurrent updates are in
    /// flight.
    pub fn update_sync<F>(&self, job_dir: &Path, mutate: F) -> StateResult<StatusDocument>
    where
        F: FnOnce(&mut StatusDocument),
    {
        let path = job_dir.join(STATUS_FILE);
        let mut doc = read_status_sync(&path);
        mutate(&mut doc);
        doc.last_updated = Some(Utc::now());

        let serialized = serde_json::to_string_pretty(&doc)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized.as_bytes())?;
        std::fs::rename(&tmp, &path)?;
        Ok(doc)
    }
}

/// Read a status document, substituting the empty default when the file is
/// missing or unparseable.
pub async fn read_status(path: &Path) -> StatusDocument {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => StatusDocument::default(),
    }
}

fn read_status_sync(path: &Path) -> StatusDocument {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => StatusDocument::default(),
    }
}

/// Merge on-disk file names missing from the job-level inventory.
///
/// Closes the crash window between "write file" and "record file": names
/// found under `files/<type>/` that the inventory does not list are appended
/// after the existing entries, in sorted scan order.
pub async fn reconcile_inventory(
    writer: &StatusWriter,
    job_dir: &Path,
) -> StateResult<StatusDocument> {
    let mut on_disk: Vec<(FileType, Vec<String>)> = Vec::new();
    for file_type in FileType::ALL {
        let dir = job_dir.join("files").join(file_type.dir_name());
        let mut names = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(kind) = entry.file_type().await
                    && kind.is_file()
                    && let Ok(name) = entry.file_name().into_string()
                {
                    names.push(name);
                }
            }
        }
        names.sort();
        on_disk.push((file_type, names));
    }

    writer
        .update(job_dir, move |doc| {
            for (file_type, names) in on_disk {
                for name in names {
                    doc.files.record(file_type, &name);
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::status::JobState;

    #[tokio::test]
    async fn missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        assert!(doc.tasks.is_empty());
        assert!(doc.files.artifacts.is_empty());
    }

    #[tokio::test]
    async fn unparseable_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATUS_FILE);
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let doc = read_status(&path).await;
        assert!(doc.tasks.is_empty());
    }

    #[tokio::test]
    async fn update_round_trips_and_stamps_last_updated() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new();

        let written = writer
            .update(dir.path(), |doc| {
                doc.id = Some("job-1".to_string());
                doc.state = Some(JobState::Running);
            })
            .await
            .unwrap();
        assert!(written.last_updated.is_some());

        let read = read_status(&dir.path().join(STATUS_FILE)).await;
        assert_eq!(read.id.as_deref(), Some("job-1"));
        assert_eq!(read.state, Some(JobState::Running));
        // No temp file is left behind.
        assert!(!dir.path().join("tasks-status.json.tmp").exists());
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(StatusWriter::new());

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let writer = writer.clone();
            let job_dir = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                writer
                    .update(&job_dir, move |doc| {
                        doc.task_mut("t")
                            .token_usage
                            .push(conveyor_core::status::TokenUsage(format!("m{i}"), i, i));
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        assert_eq!(doc.tasks["t"].token_usage.len(), 16);
    }

    #[tokio::test]
    async fn sequential_updates_preserve_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new();

        for i in 0..8u64 {
            writer
                .update(dir.path(), move |doc| {
                    doc.task_mut("t")
                        .token_usage
                        .push(conveyor_core::status::TokenUsage(format!("m{i}"), i, 0));
                })
                .await
                .unwrap();
        }

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        let keys: Vec<_> = doc.tasks["t"]
            .token_usage
            .iter()
            .map(|u| u.model_key().to_string())
            .collect();
        assert_eq!(keys, (0..8).map(|i| format!("m{i}")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn update_sync_matches_async_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new();

        writer
            .update_sync(dir.path(), |doc| {
                doc.state = Some(JobState::Failed);
            })
            .unwrap();

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        assert_eq!(doc.state, Some(JobState::Failed));
    }

    #[tokio::test]
    async fn reconcile_adds_stray_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new();
        let artifacts = dir.path().join("files").join("artifacts");
        tokio::fs::create_dir_all(&artifacts).await.unwrap();
        tokio::fs::write(artifacts.join("stray.json"), b"{}")
            .await
            .unwrap();

        writer
            .update(dir.path(), |doc| {
                doc.files.record(FileType::Artifacts, "known.json");
            })
            .await
            .unwrap();

        let doc = reconcile_inventory(&writer, dir.path()).await.unwrap();
        assert_eq!(doc.files.artifacts, vec!["known.json", "stray.json"]);

        let doc = reconcile_inventory(&writer, dir.path()).await.unwrap();
        assert_eq!(doc.files.artifacts, vec!["known.json", "stray.json"]);
    }
}
