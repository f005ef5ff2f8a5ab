//! Task-scoped typed file I/O.
//!
//! Every write lands under the job's `files/{artifacts,logs,tmp}/` tree and
//! is mirrored into both the job-level and the task-level inventory of the
//! status document. A write that succeeded on disk but whose inventory
//! update failed is tolerated: the reconciliation scan converges it.

use conveyor_core::logname::validate_log_name;
use conveyor_core::stage::Stage;
use conveyor_core::status::FileType;
use conveyor_batch::{
    BatchJobInput, BatchOptions, BatchOutcome, BatchProcessor, SqlitePool, execute_batch,
    open_store,
};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::StateResult;
use crate::writer::StatusWriter;

/// File name of the job-local durable store under `files/artifacts/`.
pub const RUN_DB: &str = "run.db";

/// Write disposition for typed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Replace,
    Append,
}

/// Task-scoped handle over a job's typed file tree.
///
/// Cheap to clone; all clones share the scheduler-owned current-stage cell.
#[derive(Clone)]
pub struct TaskIo {
    inner: Arc<Inner>,
}

struct Inner {
    job_dir: PathBuf,
    task: String,
    writer: Arc<StatusWriter>,
    current_stage: Mutex<Option<Stage>>,
}

impl TaskIo {
    pub fn new(job_dir: impl Into<PathBuf>, task: impl Into<String>, writer: Arc<StatusWriter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                job_dir: job_dir.into(),
                task: task.into(),
                writer,
                current_stage: Mutex::new(None),
            }),
        }
    }

    pub fn job_dir(&self) -> &Path {
        &self.inner.job_dir
    }

    pub fn task(&self) -> &str {
        &self.inner.task
    }

    /// The stage currently executing for this task, as maintained by the
    /// scheduler.
    pub fn current_stage(&self) -> Option<Stage> {
        *self
            .inner
            .current_stage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Scheduler-side: reflect the stage about to execute (or `None` between
    /// stages).
    pub fn set_current_stage(&self, stage: Option<Stage>) {
        *self
            .inner
            .current_stage
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = stage;
    }

    /// Absolute path of a typed file.
    pub fn path_for(&self, file_type: FileType, name: &str) -> PathBuf {
        self.inner
            .job_dir
            .join("files")
            .join(file_type.dir_name())
            .join(name)
    }

    pub async fn write_artifact(
        &self,
        name: &str,
        bytes: impl AsRef<[u8]>,
        mode: WriteMode,
    ) -> StateResult<()> {
        self.write_typed(FileType::Artifacts, name, bytes.as_ref(), mode)
            .await
    }

    /// Write a canonical application log. The name must match the
    /// `<task>-<stage>-<event>.<ext>` grammar.
    pub async fn write_log(
        &self,
        name: &str,
        bytes: impl AsRef<[u8]>,
        mode: WriteMode,
    ) -> StateResult<()> {
        validate_log_name(name)?;
        self.write_typed(FileType::Logs, name, bytes.as_ref(), mode)
            .await
    }

    pub async fn write_tmp(
        &self,
        name: &str,
        bytes: impl AsRef<[u8]>,
        mode: WriteMode,
    ) -> StateResult<()> {
        self.write_typed(FileType::Tmp, name, bytes.as_ref(), mode)
            .await
    }

    pub async fn read_artifact(&self, name: &str) -> StateResult<String> {
        self.read_typed(FileType::Artifacts, name).await
    }

    pub async fn read_log(&self, name: &str) -> StateResult<String> {
        self.read_typed(FileType::Logs, name).await
    }

    pub async fn read_tmp(&self, name: &str) -> StateResult<String> {
        self.read_typed(FileType::Tmp, name).await
    }

    /// Non-suspending log write for critical paths.
    pub fn write_log_sync(
        &self,
        name: &str,
        bytes: impl AsRef<[u8]>,
        mode: WriteMode,
    ) -> StateResult<()> {
        validate_log_name(name)?;
        let path = self.path_for(FileType::Logs, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match mode {
            WriteMode::Replace => {
                let tmp = tmp_path(&path);
                std::fs::write(&tmp, bytes.as_ref())?;
                std::fs::rename(&tmp, &path)?;
            }
            WriteMode::Append => {
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)?;
                file.write_all(bytes.as_ref())?;
            }
        }
        let task = self.inner.task.clone();
        let name = name.to_string();
        self.inner.writer.update_sync(&self.inner.job_dir, move |doc| {
            doc.record_file(FileType::Logs, &name, Some(&task));
        })?;
        Ok(())
    }

    /// Engine-internal write that bypasses the log-name grammar. Used for
    /// per-stage sinks and context snapshots, which have their own naming.
    pub async fn write_unchecked(
        &self,
        file_type: FileType,
        name: &str,
        bytes: impl AsRef<[u8]>,
        mode: WriteMode,
    ) -> StateResult<()> {
        self.write_typed(file_type, name, bytes.as_ref(), mode).await
    }

    /// Record a name in the inventories without writing bytes. Used when a
    /// file is produced through an externally held handle.
    pub async fn record_inventory(&self, file_type: FileType, name: &str) -> StateResult<()> {
        let task = self.inner.task.clone();
        let name = name.to_string();
        self.inner
            .writer
            .update(&self.inner.job_dir, move |doc| {
                doc.record_file(file_type, &name, Some(&task));
            })
            .await?;
        Ok(())
    }

    /// Open the job-local durable store at `files/artifacts/run.db` with WAL
    /// journaling and record it in the artifact inventory.
    pub async fn open_database(&self) -> StateResult<SqlitePool> {
        let path = self.path_for(FileType::Artifacts, RUN_DB);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = open_store(&path).await?;
        self.record_inventory(FileType::Artifacts, RUN_DB).await?;
        Ok(pool)
    }

    /// Open the job-local store, run a batch through it, and close the store
    /// before returning.
    pub async fn run_batch(
        &self,
        jobs: Vec<BatchJobInput>,
        processor: Arc<dyn BatchProcessor>,
        options: BatchOptions,
    ) -> StateResult<BatchOutcome> {
        let pool = self.open_database().await?;
        let outcome = execute_batch(&pool, jobs, processor, options).await;
        pool.close().await;
        Ok(outcome?)
    }

    async fn write_typed(
        &self,
        file_type: FileType,
        name: &str,
        bytes: &[u8],
        mode: WriteMode,
    ) -> StateResult<()> {
        let path = self.path_for(file_type, name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match mode {
            WriteMode::Replace => {
                let tmp = tmp_path(&path);
                tokio::fs::write(&tmp, bytes).await?;
                tokio::fs::rename(&tmp, &path).await?;
            }
            WriteMode::Append => {
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)
                    .await?;
                tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
            }
        }
        self.record_inventory(file_type, name).await?;
        Ok(())
    }

    async fn read_typed(&self, file_type: FileType, name: &str) -> StateResult<String> {
        let path = self.path_for(file_type, name);
        Ok(tokio::fs::read_to_string(&path).await?)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateError;
    use crate::writer::{STATUS_FILE, read_status};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    fn task_io(dir: &tempfile::TempDir) -> TaskIo {
        TaskIo::new(dir.path(), "draft", Arc::new(StatusWriter::new()))
    }

    #[tokio::test]
    async fn artifact_write_records_both_inventories() {
        let dir = tempfile::tempdir().unwrap();
        let io = task_io(&dir);

        io.write_artifact("out.json", b"{}", WriteMode::Replace)
            .await
            .unwrap();

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        assert_eq!(doc.files.artifacts, vec!["out.json"]);
        assert_eq!(doc.tasks["draft"].files.artifacts, vec!["out.json"]);
    }

    #[tokio::test]
    async fn repeated_writes_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let io = task_io(&dir);

        for _ in 0..3 {
            io.write_artifact("out.json", b"{}", WriteMode::Replace)
                .await
                .unwrap();
        }

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        assert_eq!(doc.files.artifacts.len(), 1);
        assert_eq!(doc.tasks["draft"].files.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn append_mode_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let io = task_io(&dir);

        io.write_tmp("scratch.txt", b"one\n", WriteMode::Append)
            .await
            .unwrap();
        io.write_tmp("scratch.txt", b"two\n", WriteMode::Append)
            .await
            .unwrap();

        assert_eq!(io.read_tmp("scratch.txt").await.unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn replace_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let io = task_io(&dir);

        io.write_artifact("out.json", b"{\"v\":1}", WriteMode::Replace)
            .await
            .unwrap();
        io.write_artifact("out.json", b"{\"v\":2}", WriteMode::Replace)
            .await
            .unwrap();

        assert_eq!(io.read_artifact("out.json").await.unwrap(), "{\"v\":2}");
        assert!(!io.path_for(FileType::Artifacts, "out.json.tmp").exists());
    }

    #[tokio::test]
    async fn log_names_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let io = task_io(&dir);

        io.write_log("draft-inference-response.json", b"{}", WriteMode::Replace)
            .await
            .unwrap();
        let err = io
            .write_log("free-form.log", b"", WriteMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Core(conveyor_core::Error::InvalidLogName(_))
        ));
    }

    #[tokio::test]
    async fn log_write_sync_matches_async_surface() {
        let dir = tempfile::tempdir().unwrap();
        let io = task_io(&dir);

        io.write_log_sync("draft-inference-error.log", b"boom\n", WriteMode::Append)
            .unwrap();

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        assert_eq!(doc.files.logs, vec!["draft-inference-error.log"]);
        assert_eq!(
            io.read_log("draft-inference-error.log").await.unwrap(),
            "boom\n"
        );
    }

    struct Echo;

    #[async_trait]
    impl BatchProcessor for Echo {
        async fn process(
            &self,
            input: Value,
            _ctx: conveyor_batch::BatchContext,
        ) -> anyhow::Result<Value> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn run_batch_records_store_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let io = task_io(&dir);

        let outcome = io
            .run_batch(
                vec![BatchJobInput::new("a", json!(1))],
                Arc::new(Echo),
                BatchOptions {
                    batch_id: Some("b".to_string()),
                    ..BatchOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.completed.len(), 1);

        let doc = read_status(&dir.path().join(STATUS_FILE)).await;
        assert!(doc.files.artifacts.iter().any(|n| n == RUN_DB));
        assert!(io.path_for(FileType::Artifacts, RUN_DB).exists());
    }
}
