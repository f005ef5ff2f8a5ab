//! The per-job supervision loop.

use chrono::{DateTime, Utc};
use conveyor_config::{LifecyclePaths, Pipeline};
use conveyor_core::status::{JobState, TaskState};
use conveyor_scheduler::{ModelBus, TaskRegistry, TaskRunSpec, TaskScheduler};
use conveyor_state::{STATUS_FILE, StatusWriter, read_status, reconcile_inventory};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::pid::PidFile;
use crate::{RunnerError, RunnerResult};

/// One line of `<completeDir>/runs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub name: String,
    pub pipeline_id: String,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<String>,
    pub total_execution_time: u64,
    pub total_refinement_attempts: u32,
    pub final_artifacts: Vec<String>,
}

/// Drives one job through its pipeline's ordered task list.
pub struct Supervisor {
    paths: LifecyclePaths,
    pipeline: Pipeline,
    registry: TaskRegistry,
    writer: Arc<StatusWriter>,
    bus: ModelBus,
}

impl Supervisor {
    pub fn new(paths: LifecyclePaths, pipeline: Pipeline, registry: TaskRegistry) -> Self {
        Self {
            paths,
            pipeline,
            registry,
            writer: Arc::new(StatusWriter::new()),
            bus: ModelBus::new(),
        }
    }

    /// Share an externally owned model bus (the model client publishes onto
    /// it).
    pub fn with_bus(mut self, bus: ModelBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn writer(&self) -> Arc<StatusWriter> {
        self.writer.clone()
    }

    /// Run every task of the pipeline for `job_id`, then promote the working
    /// directory into the completed lifecycle dir.
    ///
    /// On task failure the working directory stays in `current/` with the
    /// status document reflecting the failure, and the error surfaces to the
    /// caller for a non-zero process exit. The PID file is removed on every
    /// exit path.
    pub async fn run_job(&self, job_id: &str) -> RunnerResult<RunSummary> {
        let job_dir = self.paths.job_dir(job_id);
        let pid = PidFile::create(job_dir.join("runner.pid"))?;

        for task in &self.pipeline.tasks {
            if let Some(module) = &task.module
                && !module.is_absolute()
            {
                return Err(RunnerError::ModulePathInvalid(module.clone()));
            }
        }

        let seed = load_seed(&job_dir).await?;
        let max_refinements = seed
            .get("maxRefinements")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .or(self.pipeline.max_refinements)
            .unwrap_or(1);

        if let Err(error) = reconcile_inventory(&self.writer, &job_dir).await {
            warn!(job = %job_id, error = %error, "Inventory reconciliation failed");
        }

        let pipeline_id = self.pipeline.id.clone();
        let job = job_id.to_string();
        if let Err(error) = self
            .writer
            .update(&job_dir, move |doc| {
                doc.id = Some(job);
                doc.pipeline_id = Some(pipeline_id);
            })
            .await
        {
            warn!(job = %job_id, error = %error, "Status bookkeeping write failed");
        }

        let scheduler = TaskScheduler::new(self.writer.clone(), self.bus.clone());
        let task_names = self.pipeline.task_names();
        let mut pipeline_artifacts: Map<String, Value> = Map::new();
        let mut total_execution_time: u64 = 0;
        let mut total_refinements: u32 = 0;

        for task in &task_names {
            let handlers = self
                .registry
                .get(task)
                .ok_or_else(|| RunnerError::UnknownTask(task.clone()))?;

            let status = read_status(&job_dir.join(STATUS_FILE)).await;
            if let Some(record) = status.tasks.get(task)
                && record.state == TaskState::Done
            {
                info!(job = %job_id, task = %task, "Task already done; loading persisted output");
                if let Some(output) = load_task_output(&job_dir, task).await {
                    pipeline_artifacts.insert(task.clone(), output);
                }
                total_execution_time += record.execution_time.unwrap_or(0);
                total_refinements += record.refinement_attempts;
                continue;
            }

            self.mark_task_running(&job_dir, task).await;
            self.write_letter(&job_dir, task).await?;

            let spec = TaskRunSpec {
                job_id: job_id.to_string(),
                pipeline_id: self.pipeline.id.clone(),
                task: task.clone(),
                pipeline_tasks: task_names.clone(),
                seed: seed.clone(),
                artifacts: pipeline_artifacts.clone(),
                max_refinements,
            };

            match scheduler.run_task(&job_dir, &handlers, spec).await {
                Ok(success) => {
                    let task_dir = job_dir.join("tasks").join(task);
                    tokio::fs::write(
                        task_dir.join("output.json"),
                        serde_json::to_string_pretty(&success.output)?,
                    )
                    .await?;
                    tokio::fs::write(
                        task_dir.join("execution-logs.json"),
                        serde_json::to_string_pretty(&success.run_log)?,
                    )
                    .await?;

                    let execution_time: u64 =
                        success.run_log.iter().filter_map(|entry| entry.ms).sum();
                    total_execution_time += execution_time;
                    total_refinements += success.refinement_attempts;
                    pipeline_artifacts.insert(task.clone(), success.output.clone());

                    self.mark_task_done(&job_dir, task, execution_time).await;
                }
                Err(failure) => {
                    // Fatal-exit path: persist the failure synchronously so
                    // the document is final even while the runtime unwinds.
                    let task_name = task.clone();
                    let envelope = failure.envelope.clone();
                    let stage = failure.stage;
                    if let Err(error) = self.writer.update_sync(&job_dir, move |doc| {
                        doc.state = Some(JobState::Failed);
                        let record = doc.task_mut(&task_name);
                        record.state = TaskState::Failed;
                        record.failed_stage = Some(stage.to_string());
                        record.error = Some(envelope);
                        record.ended_at = Some(Utc::now());
                    }) {
                        warn!(job = %job_id, error = %error, "Final failure write failed");
                    }
                    return Err(RunnerError::TaskFailed {
                        task: task.clone(),
                        stage: failure.stage,
                        envelope: Box::new(failure.envelope),
                    });
                }
            }
        }

        let status = read_status(&job_dir.join(STATUS_FILE)).await;
        let mut final_artifacts = task_names.clone();
        for name in &status.files.artifacts {
            if !final_artifacts.contains(name) {
                final_artifacts.push(name.clone());
            }
        }

        let summary = RunSummary {
            name: job_id.to_string(),
            pipeline_id: self.pipeline.id.clone(),
            finished_at: Utc::now(),
            tasks: task_names,
            total_execution_time,
            total_refinement_attempts: total_refinements,
            final_artifacts,
        };

        // Promote: the PID file must go before the directory moves, or it
        // would travel into complete/ with it.
        pid.remove();
        tokio::fs::create_dir_all(&self.paths.complete).await?;
        tokio::fs::rename(&job_dir, self.paths.completed_job_dir(job_id)).await?;
        append_run_summary(&self.paths.runs_log(), &summary)?;

        info!(job = %job_id, pipeline = %summary.pipeline_id, "Job promoted to complete");
        Ok(summary)
    }

    async fn mark_task_running(&self, job_dir: &Path, task: &str) {
        let task_name = task.to_string();
        if let Err(error) = self
            .writer
            .update(job_dir, move |doc| {
                doc.state = Some(JobState::Running);
                doc.current = Some(task_name.clone());
                let record = doc.task_mut(&task_name);
                record.state = TaskState::Running;
                record.started_at = Some(Utc::now());
                record.attempts += 1;
            })
            .await
        {
            warn!(task = %task, error = %error, "Status bookkeeping write failed");
        }
    }

    async fn mark_task_done(&self, job_dir: &Path, task: &str, execution_time: u64) {
        let task_name = task.to_string();
        if let Err(error) = self
            .writer
            .update(job_dir, move |doc| {
                let record = doc.task_mut(&task_name);
                record.state = TaskState::Done;
                record.ended_at = Some(Utc::now());
                record.execution_time = Some(execution_time);
                // The task name is the handle of its persisted output, ahead
                // of any files it wrote itself.
                let written = record.files.artifacts.clone();
                record.record_artifact(&task_name);
                for name in written {
                    record.record_artifact(&name);
                }
            })
            .await
        {
            warn!(task = %task, error = %error, "Status bookkeeping write failed");
        }
    }

    /// Provenance marker for the task directory.
    async fn write_letter(&self, job_dir: &Path, task: &str) -> RunnerResult<()> {
        let task_dir = job_dir.join("tasks").join(task);
        tokio::fs::create_dir_all(&task_dir).await?;
        let letter = serde_json::json!({ "task": task, "at": Utc::now() });
        tokio::fs::write(
            task_dir.join("letter.json"),
            serde_json::to_string_pretty(&letter)?,
        )
        .await?;
        Ok(())
    }
}

async fn load_seed(job_dir: &Path) -> RunnerResult<Value> {
    let bytes = tokio::fs::read(job_dir.join("seed.json")).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn load_task_output(job_dir: &Path, task: &str) -> Option<Value> {
    let path = job_dir.join("tasks").join(task).join("output.json");
    let bytes = tokio::fs::read(&path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn append_run_summary(path: &Path, summary: &RunSummary) -> RunnerResult<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    let mut line = serde_json::to_string(summary)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Create a job skeleton under the current lifecycle dir: the working
/// directory, the immutable seed, the typed file tree, and the initial
/// status document.
pub async fn create_job(
    paths: &LifecyclePaths,
    job_id: &str,
    pipeline: &Pipeline,
    seed: &Value,
) -> RunnerResult<()> {
    let job_dir = paths.job_dir(job_id);
    if job_dir.exists() {
        return Err(RunnerError::JobExists(job_id.to_string()));
    }
    tokio::fs::create_dir_all(job_dir.join("tasks")).await?;
    for sub in ["artifacts", "logs", "tmp"] {
        tokio::fs::create_dir_all(job_dir.join("files").join(sub)).await?;
    }
    tokio::fs::write(
        job_dir.join("seed.json"),
        serde_json::to_string_pretty(seed)?,
    )
    .await?;

    let writer = StatusWriter::new();
    let job = job_id.to_string();
    let pipeline_id = pipeline.id.clone();
    writer
        .update(&job_dir, move |doc| {
            doc.id = Some(job);
            doc.state = Some(JobState::Pending);
            doc.pipeline_id = Some(pipeline_id);
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::TaskSpec;
    use conveyor_core::Stage;
    use conveyor_scheduler::{StageContext, TaskHandlers, handler_fn};
    use serde_json::json;
    use std::path::PathBuf;

    fn pipeline(tasks: &[&str]) -> Pipeline {
        Pipeline {
            id: "test-pipeline".to_string(),
            tasks: tasks
                .iter()
                .map(|name| TaskSpec {
                    name: name.to_string(),
                    module: None,
                })
                .collect(),
            max_refinements: None,
        }
    }

    fn ok_handlers() -> TaskHandlers {
        TaskHandlers::new()
            .with_stage(
                Stage::Ingestion,
                handler_fn(|_ctx| async { Ok(json!({ "output": { "ok": true }, "flags": {} })) }),
            )
            .with_stage(
                Stage::Integration,
                handler_fn(|_ctx| async { Ok(json!({ "output": { "ok": true }, "flags": {} })) }),
            )
    }

    async fn seeded_job(paths: &LifecyclePaths, pipeline: &Pipeline, job_id: &str) {
        create_job(paths, job_id, pipeline, &json!({ "topic": "demo" }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn two_task_happy_path_promotes_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LifecyclePaths::under(dir.path());
        let pipeline = pipeline(&["a", "b"]);
        seeded_job(&paths, &pipeline, "job-1").await;

        let registry = TaskRegistry::new()
            .register("a", ok_handlers())
            .register("b", ok_handlers());
        let supervisor = Supervisor::new(paths.clone(), pipeline, registry);
        let summary = supervisor.run_job("job-1").await.unwrap();

        assert_eq!(summary.tasks, vec!["a", "b"]);
        assert!(summary.final_artifacts.contains(&"a".to_string()));
        assert!(summary.final_artifacts.contains(&"b".to_string()));

        // Promoted out of current/, PID file gone.
        assert!(!paths.job_dir("job-1").exists());
        let promoted = paths.completed_job_dir("job-1");
        assert!(promoted.join("tasks").join("a").join("output.json").exists());
        assert!(promoted.join("tasks").join("b").join("letter.json").exists());
        assert!(!promoted.join("runner.pid").exists());

        let status = read_status(&promoted.join(STATUS_FILE)).await;
        assert_eq!(status.state, Some(JobState::Done));
        assert_eq!(status.progress, Some(100));
        assert_eq!(status.tasks["a"].state, TaskState::Done);
        assert_eq!(status.tasks["b"].state, TaskState::Done);
        assert!(status.current.is_none());
        assert!(status.current_stage.is_none());

        let runs = std::fs::read_to_string(paths.runs_log()).unwrap();
        let lines: Vec<_> = runs.lines().collect();
        assert_eq!(lines.len(), 1);
        let logged: RunSummary = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(logged.name, "job-1");
        assert_eq!(logged.tasks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_task_keeps_the_job_in_current() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LifecyclePaths::under(dir.path());
        let pipeline = pipeline(&["a"]);
        seeded_job(&paths, &pipeline, "job-1").await;

        let handlers = TaskHandlers::new().with_stage(
            Stage::Inference,
            handler_fn(|_ctx| async { Ok(json!("hello")) }),
        );
        let registry = TaskRegistry::new().register("a", handlers);
        let supervisor = Supervisor::new(paths.clone(), pipeline, registry);

        let err = supervisor.run_job("job-1").await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::TaskFailed { ref task, stage: Stage::Inference, .. } if task == "a"
        ));

        let job_dir = paths.job_dir("job-1");
        assert!(job_dir.exists());
        assert!(!paths.completed_job_dir("job-1").exists());
        assert!(!job_dir.join("runner.pid").exists());

        let status = read_status(&job_dir.join(STATUS_FILE)).await;
        assert_eq!(status.state, Some(JobState::Failed));
        assert_eq!(status.tasks["a"].state, TaskState::Failed);
        assert_eq!(status.tasks["a"].failed_stage.as_deref(), Some("inference"));
        assert_eq!(status.tasks["a"].attempts, 1);
    }

    #[tokio::test]
    async fn done_tasks_are_resumed_not_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LifecyclePaths::under(dir.path());
        let pipeline = pipeline(&["a", "b"]);
        seeded_job(&paths, &pipeline, "job-1").await;

        // Persist task a as already done with an output on disk.
        let job_dir = paths.job_dir("job-1");
        let a_dir = job_dir.join("tasks").join("a");
        tokio::fs::create_dir_all(&a_dir).await.unwrap();
        tokio::fs::write(a_dir.join("output.json"), r#"{"cached":true}"#)
            .await
            .unwrap();
        StatusWriter::new()
            .update(&job_dir, |doc| {
                let record = doc.task_mut("a");
                record.state = TaskState::Done;
                record.execution_time = Some(42);
            })
            .await
            .unwrap();

        // Task a's handlers would fail loudly if invoked.
        let poisoned = TaskHandlers::new().with_stage(
            Stage::Ingestion,
            handler_fn(|_ctx| async { anyhow::bail!("must not run") }),
        );
        let observed = std::sync::Arc::new(std::sync::Mutex::new(None));
        let sink = observed.clone();
        let b_handlers = TaskHandlers::new().with_stage(
            Stage::Ingestion,
            handler_fn(move |ctx: StageContext| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() = ctx.data.get("a").cloned();
                    Ok(json!({ "output": {}, "flags": {} }))
                }
            }),
        );
        let registry = TaskRegistry::new()
            .register("a", poisoned)
            .register("b", b_handlers);

        let supervisor = Supervisor::new(paths.clone(), pipeline, registry);
        let summary = supervisor.run_job("job-1").await.unwrap();

        // Task a's persisted output reached task b's data.
        assert_eq!(
            observed.lock().unwrap().clone(),
            Some(json!({ "cached": true }))
        );
        assert!(summary.total_execution_time >= 42);
    }

    #[tokio::test]
    async fn relative_module_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LifecyclePaths::under(dir.path());
        let mut pipeline = pipeline(&["a"]);
        pipeline.tasks[0].module = Some(PathBuf::from("handlers/a"));
        seeded_job(&paths, &pipeline, "job-1").await;

        let registry = TaskRegistry::new().register("a", ok_handlers());
        let supervisor = Supervisor::new(paths.clone(), pipeline, registry);

        let err = supervisor.run_job("job-1").await.unwrap_err();
        assert!(matches!(err, RunnerError::ModulePathInvalid(_)));
        // Fatal before any task ran, PID file already cleaned up.
        assert!(!paths.job_dir("job-1").join("runner.pid").exists());
        let status = read_status(&paths.job_dir("job-1").join(STATUS_FILE)).await;
        assert!(status.tasks.is_empty());
    }

    #[tokio::test]
    async fn pid_file_is_present_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LifecyclePaths::under(dir.path());
        let pipeline = pipeline(&["a"]);
        seeded_job(&paths, &pipeline, "job-1").await;

        let job_dir = paths.job_dir("job-1");
        let seen = std::sync::Arc::new(std::sync::Mutex::new(false));
        let sink = seen.clone();
        let pid_path = job_dir.join("runner.pid");
        let handlers = TaskHandlers::new().with_stage(
            Stage::Ingestion,
            handler_fn(move |_ctx| {
                let sink = sink.clone();
                let pid_path = pid_path.clone();
                async move {
                    *sink.lock().unwrap() = pid_path.exists();
                    Ok(json!({ "output": {}, "flags": {} }))
                }
            }),
        );
        let registry = TaskRegistry::new().register("a", handlers);
        Supervisor::new(paths.clone(), pipeline, registry)
            .run_job("job-1")
            .await
            .unwrap();

        assert!(*seen.lock().unwrap());
    }

    #[tokio::test]
    async fn cancelled_run_removes_pid_file_without_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LifecyclePaths::under(dir.path());
        let pipeline = pipeline(&["a"]);
        seeded_job(&paths, &pipeline, "job-1").await;

        // First task blocks forever, as a signal-interrupted run would.
        let handlers = TaskHandlers::new().with_stage(
            Stage::Ingestion,
            handler_fn(|_ctx| async {
                std::future::pending::<()>().await;
                Ok(json!({ "output": {}, "flags": {} }))
            }),
        );
        let registry = TaskRegistry::new().register("a", handlers);
        let supervisor = Supervisor::new(paths.clone(), pipeline, registry);

        let run = supervisor.run_job("job-1");
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("blocked task must not finish"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
        let job_dir = paths.job_dir("job-1");
        assert!(job_dir.join("runner.pid").exists());

        // Dropping the run future is what signal handling does.
        drop(run);

        assert!(!job_dir.join("runner.pid").exists());
        assert!(job_dir.exists());
        assert!(!paths.completed_job_dir("job-1").exists());
        let status = read_status(&job_dir.join(STATUS_FILE)).await;
        assert_eq!(status.tasks["a"].state, TaskState::Running);
    }

    #[tokio::test]
    async fn unknown_tasks_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LifecyclePaths::under(dir.path());
        let pipeline = pipeline(&["a"]);
        seeded_job(&paths, &pipeline, "job-1").await;

        let supervisor = Supervisor::new(paths.clone(), pipeline, TaskRegistry::new());
        let err = supervisor.run_job("job-1").await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownTask(ref task) if task == "a"));
    }

    #[tokio::test]
    async fn create_job_refuses_existing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LifecyclePaths::under(dir.path());
        let pipeline = pipeline(&["a"]);
        seeded_job(&paths, &pipeline, "job-1").await;

        let err = create_job(&paths, "job-1", &pipeline, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::JobExists(_)));
    }
}
