//! The per-task stage execution loop.

use conveyor_core::flags::{FlagMap, FlagType, needs_refinement};
use conveyor_core::progress::progress_percent;
use conveyor_core::stage::Stage;
use conveyor_core::status::{ErrorDebug, ErrorEnvelope, FileType, JobState, TaskState};
use conveyor_state::{STATUS_FILE, StatusWriter, TaskIo, WriteMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::{StageContext, StageMeta, Validators};
use crate::error::SchedulerError;
use crate::handler::{StagePlan, TaskHandlers};
use crate::logger::StageLogger;
use crate::model::{ModelBus, UsageForwarder};

/// Inputs for one task run.
#[derive(Debug, Clone)]
pub struct TaskRunSpec {
    pub job_id: String,
    pub pipeline_id: String,
    pub task: String,
    /// Ordered task list of the whole pipeline, for progress computation.
    pub pipeline_tasks: Vec<String>,
    pub seed: Value,
    /// Outputs of previously completed tasks, keyed by task name.
    pub artifacts: Map<String, Value>,
    /// Refinement budget, from the seed (default 1).
    pub max_refinements: u32,
}

/// One entry of the in-memory run log, persisted as `execution-logs.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLogEntry {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StageLogEntry {
    fn executed(stage: Stage, ms: u64) -> Self {
        Self {
            stage: stage.to_string(),
            ok: Some(true),
            ms: Some(ms),
            skipped: None,
            reason: None,
        }
    }

    fn skipped(stage: Stage, reason: Option<&str>) -> Self {
        Self {
            stage: stage.to_string(),
            ok: None,
            ms: None,
            skipped: Some(true),
            reason: reason.map(str::to_string),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.ok == Some(true)
    }
}

/// Result of a successful task run.
#[derive(Debug)]
pub struct TaskSuccess {
    /// Output of the last non-validation executed stage.
    pub output: Value,
    pub data: Map<String, Value>,
    pub flags: FlagMap,
    pub run_log: Vec<StageLogEntry>,
    pub refinement_attempts: u32,
    /// `request:error` messages observed on the model bus.
    pub request_errors: Vec<String>,
}

/// Structured result of a failed task run.
#[derive(Debug)]
pub struct TaskFailure {
    pub stage: Stage,
    pub envelope: ErrorEnvelope,
    pub run_log: Vec<StageLogEntry>,
}

struct RunState {
    data: Map<String, Value>,
    flags: FlagMap,
    last_output: Value,
    last_stage: Option<Stage>,
    run_log: Vec<StageLogEntry>,
    refinements: u32,
}

struct RunEnv {
    job_dir: PathBuf,
    io: TaskIo,
    meta: Arc<StageMeta>,
}

/// Executes one task through the canonical stage list.
pub struct TaskScheduler {
    writer: Arc<StatusWriter>,
    bus: ModelBus,
    plan: StagePlan,
}

impl TaskScheduler {
    pub fn new(writer: Arc<StatusWriter>, bus: ModelBus) -> Self {
        Self {
            writer,
            bus,
            plan: StagePlan::default(),
        }
    }

    pub fn with_plan(writer: Arc<StatusWriter>, bus: ModelBus, plan: StagePlan) -> Self {
        Self { writer, bus, plan }
    }

    /// Run `spec.task` through the canonical stages.
    ///
    /// Status bookkeeping failures are logged at warn level and never mask
    /// the task outcome. The model-bus subscription is dropped on both exit
    /// paths.
    pub async fn run_task(
        &self,
        job_dir: &Path,
        handlers: &TaskHandlers,
        spec: TaskRunSpec,
    ) -> Result<TaskSuccess, Box<TaskFailure>> {
        let io = TaskIo::new(job_dir, &spec.task, self.writer.clone());
        let meta = Arc::new(StageMeta {
            task: spec.task.clone(),
            job_id: spec.job_id.clone(),
            work_dir: job_dir.to_path_buf(),
            status_path: job_dir.join(STATUS_FILE),
            model_config: spec.seed.get("modelConfig").cloned().unwrap_or(Value::Null),
            pipeline_tasks: spec.pipeline_tasks.clone(),
            pipeline_id: spec.pipeline_id.clone(),
        });
        let env = RunEnv {
            job_dir: job_dir.to_path_buf(),
            io,
            meta,
        };

        let mut data = Map::new();
        data.insert("seed".to_string(), spec.seed.clone());
        for (task, output) in spec.artifacts.clone() {
            data.insert(task, output);
        }
        let mut state = RunState {
            data,
            flags: FlagMap::new(),
            last_output: spec.seed.clone(),
            last_stage: None,
            run_log: Vec::new(),
            refinements: 0,
        };

        let forwarder = UsageForwarder::spawn(
            self.writer.clone(),
            env.job_dir.clone(),
            spec.task.clone(),
            self.bus.subscribe(),
        );

        let outcome = self.run_stages(&env, handlers, &mut state, &spec).await;
        env.io.set_current_stage(None);
        let request_errors = forwarder.flush().await;

        match outcome {
            Ok(()) => {
                let task = spec.task.clone();
                let refinements = state.refinements;
                self.record_status(&env.job_dir, move |doc| {
                    doc.state = Some(JobState::Done);
                    doc.current = None;
                    doc.current_stage = None;
                    doc.progress = Some(100);
                    let record = doc.task_mut(&task);
                    record.state = TaskState::Done;
                    record.current_stage = None;
                    record.refinement_attempts = refinements;
                })
                .await;
                info!(task = %spec.task, refinements, "Task completed");
                Ok(TaskSuccess {
                    output: state.last_output,
                    data: state.data,
                    flags: state.flags,
                    run_log: state.run_log,
                    refinement_attempts: state.refinements,
                    request_errors,
                })
            }
            Err((stage, cause)) => {
                let envelope = build_envelope(&env, &state, stage, &cause);
                let task = spec.task.clone();
                let persisted = envelope.clone();
                self.record_status(&env.job_dir, move |doc| {
                    doc.state = Some(JobState::Failed);
                    let record = doc.task_mut(&task);
                    record.state = TaskState::Failed;
                    record.failed_stage = Some(stage.to_string());
                    record.error = Some(persisted);
                })
                .await;
                error!(task = %spec.task, stage = %stage, error = %cause, "Task failed");
                Err(Box::new(TaskFailure {
                    stage,
                    envelope,
                    run_log: state.run_log,
                }))
            }
        }
    }

    async fn run_stages(
        &self,
        env: &RunEnv,
        handlers: &TaskHandlers,
        state: &mut RunState,
        spec: &TaskRunSpec,
    ) -> Result<(), (Stage, SchedulerError)> {
        let validate_structure = Stage::ValidateStructure.index();
        let final_validation = Stage::FinalValidation.index();

        for &stage in &Stage::ALL[..=final_validation] {
            self.execute_stage(env, handlers, state, stage)
                .await
                .map_err(|cause| (stage, cause))?;
        }

        while needs_refinement(&state.flags) && state.refinements < spec.max_refinements {
            state.refinements += 1;
            let task = spec.task.clone();
            let attempts = state.refinements;
            self.record_status(&env.job_dir, move |doc| {
                doc.task_mut(&task).refinement_attempts = attempts;
            })
            .await;
            info!(task = %spec.task, attempt = attempts, "Refinement pass over validation window");

            for &stage in &Stage::ALL[validate_structure..=final_validation] {
                self.execute_stage(env, handlers, state, stage)
                    .await
                    .map_err(|cause| (stage, cause))?;
            }
        }

        self.execute_stage(env, handlers, state, Stage::Integration)
            .await
            .map_err(|cause| (Stage::Integration, cause))
    }

    async fn execute_stage(
        &self,
        env: &RunEnv,
        handlers: &TaskHandlers,
        state: &mut RunState,
        stage: Stage,
    ) -> Result<(), SchedulerError> {
        let Some(handler) = handlers.get(stage).cloned() else {
            debug!(task = %env.meta.task, stage = %stage, "No handler registered; stage skipped");
            state.run_log.push(StageLogEntry::skipped(stage, None));
            return Ok(());
        };

        if let Some(spec) = self.plan.spec(stage)
            && let Some(skip_if) = &spec.skip_if
            && skip_if(&state.flags)
        {
            debug!(task = %env.meta.task, stage = %stage, "Skip predicate matched");
            state.run_log.push(StageLogEntry::skipped(
                stage,
                Some("skipIf predicate returned true"),
            ));
            return Ok(());
        }

        env.io.set_current_stage(Some(stage));
        let task = env.meta.task.clone();
        self.record_status(&env.job_dir, move |doc| {
            doc.current = Some(task.clone());
            doc.current_stage = Some(stage.to_string());
            let record = doc.task_mut(&task);
            record.state = TaskState::Running;
            record.current_stage = Some(stage.to_string());
        })
        .await;

        // Stage-scoped sink, released on every exit path when the last clone
        // drops at the end of this scope.
        let log_name = format!("stage-{stage}.log");
        let logger = StageLogger::open(env.io.path_for(FileType::Logs, &log_name));
        if let Err(e) = env.io.record_inventory(FileType::Logs, &log_name).await {
            warn!(stage = %stage, error = %e, "Stage log not recorded in inventory");
        }

        let snapshot_name = format!("stage-{stage}-context.json");
        let snapshot = context_snapshot(state, stage);
        let pretty = serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = env
            .io
            .write_unchecked(FileType::Logs, &snapshot_name, pretty, WriteMode::Replace)
            .await
        {
            warn!(stage = %stage, error = %e, "Context snapshot not written");
        }

        if let Some(spec) = self.plan.spec(stage)
            && let Some(requires) = &spec.requires
        {
            check_requires(stage, requires, &state.flags)?;
        }

        let ctx = StageContext {
            meta: env.meta.clone(),
            data: state.data.clone(),
            flags: state.flags.clone(),
            current_stage: stage,
            previous_stage: state.last_stage,
            output: state.last_output.clone(),
            io: env.io.clone(),
            llm: self.bus.clone(),
            validators: Validators,
            log: logger.clone(),
        };

        let started = Instant::now();
        let raw = handler.run(ctx).await.map_err(|cause| {
            logger.error(&format!("handler failed: {cause:#}"));
            SchedulerError::Handler {
                stage,
                message: cause.to_string(),
                stack: Some(format!("{cause:?}")),
            }
        })?;
        let ms = started.elapsed().as_millis() as u64;

        let (output, produced) = validate_contract(stage, raw)?;
        if let Some(spec) = self.plan.spec(stage)
            && let Some(produces) = &spec.produces
        {
            check_produces(stage, produces, &produced)?;
        }
        check_conflicts(stage, &state.flags, &produced)?;

        state.data.insert(stage.to_string(), output.clone());
        for (key, value) in produced {
            state.flags.insert(key, value);
        }
        if !stage.is_validation() {
            state.last_output = output;
            state.last_stage = Some(stage);
        }

        let progress = progress_percent(
            &env.meta.pipeline_tasks,
            Some(&env.meta.task),
            Some(stage.as_str()),
        );
        let task = env.meta.task.clone();
        self.record_status(&env.job_dir, move |doc| {
            doc.progress = Some(progress);
            doc.current = Some(task.clone());
            doc.current_stage = Some(stage.to_string());
            doc.task_mut(&task).state = TaskState::Running;
        })
        .await;

        state.run_log.push(StageLogEntry::executed(stage, ms));
        info!(task = %env.meta.task, stage = %stage, ms, "Stage completed");
        Ok(())
    }

    /// Bookkeeping write: failures are warned about, never propagated.
    async fn record_status<F>(&self, job_dir: &Path, mutate: F)
    where
        F: FnOnce(&mut conveyor_core::StatusDocument),
    {
        if let Err(e) = self.writer.update(job_dir, mutate).await {
            warn!(error = %e, "Status bookkeeping write failed");
        }
    }
}

/// Shape summary of a JSON value: type plus top-level keys or length, never
/// raw data.
fn shape_summary(value: &Value) -> Value {
    match value {
        Value::Object(map) => json!({
            "type": "object",
            "keys": map.keys().collect::<Vec<_>>(),
        }),
        Value::Array(items) => json!({ "type": "array", "length": items.len() }),
        Value::String(_) => json!({ "type": "string" }),
        Value::Number(_) => json!({ "type": "number" }),
        Value::Bool(_) => json!({ "type": "bool" }),
        Value::Null => json!({ "type": "null" }),
    }
}

fn context_snapshot(state: &RunState, stage: Stage) -> Value {
    json!({
        "stage": stage.to_string(),
        "previousStage": state.last_stage.map(|s| s.to_string()),
        "dataKeys": state.data.keys().collect::<Vec<_>>(),
        "seed": shape_summary(state.data.get("seed").unwrap_or(&Value::Null)),
        "flagKeys": state.flags.keys().collect::<Vec<_>>(),
        "output": shape_summary(&state.last_output),
    })
}

/// Decode a raw handler result into `{output, flags}`.
fn validate_contract(stage: Stage, raw: Value) -> Result<(Value, FlagMap), SchedulerError> {
    let violation = |message: String| SchedulerError::ContractViolation { stage, message };

    let Value::Object(mut map) = raw else {
        return Err(violation(format!(
            "handler must return an object with keys \"output\" and \"flags\", got {}",
            json_type(&raw)
        )));
    };
    let Some(output) = map.remove("output") else {
        return Err(violation("result is missing key \"output\"".to_string()));
    };
    let Some(flags_value) = map.remove("flags") else {
        return Err(violation("result is missing key \"flags\"".to_string()));
    };
    if !map.is_empty() {
        let extra: Vec<_> = map.keys().cloned().collect();
        return Err(violation(format!("result has unexpected keys {extra:?}")));
    }
    let Value::Object(flags) = flags_value else {
        return Err(violation(format!(
            "\"flags\" must be a plain object, got {}",
            json_type(&flags_value)
        )));
    };
    for (key, value) in &flags {
        if FlagType::of(value).is_none() {
            return Err(violation(format!(
                "flag {key:?} must be a scalar or object, got {}",
                json_type(value)
            )));
        }
    }
    Ok((output, flags))
}

fn check_requires(
    stage: Stage,
    requires: &HashMap<String, FlagType>,
    flags: &FlagMap,
) -> Result<(), SchedulerError> {
    for (key, expected) in requires {
        let Some(value) = flags.get(key) else {
            return Err(SchedulerError::PrerequisiteFlagMissing {
                stage,
                key: key.clone(),
            });
        };
        let actual = FlagType::of(value);
        if actual != Some(*expected) {
            return Err(SchedulerError::PrerequisiteFlagTypeMismatch {
                stage,
                key: key.clone(),
                expected: *expected,
                actual: actual.unwrap_or(FlagType::Object),
            });
        }
    }
    Ok(())
}

fn check_produces(
    stage: Stage,
    produces: &HashMap<String, FlagType>,
    produced: &FlagMap,
) -> Result<(), SchedulerError> {
    for (key, expected) in produces {
        if let Some(value) = produced.get(key) {
            let actual = FlagType::of(value);
            if actual != Some(*expected) {
                return Err(SchedulerError::ContractViolation {
                    stage,
                    message: format!(
                        "produced flag {key:?} is {}, declared {expected}",
                        actual.map(|t| t.to_string()).unwrap_or_else(|| "invalid".into())
                    ),
                });
            }
        }
    }
    Ok(())
}

fn check_conflicts(stage: Stage, flags: &FlagMap, produced: &FlagMap) -> Result<(), SchedulerError> {
    for (key, value) in produced {
        if let Some(existing) = flags.get(key)
            && let (Some(existing_type), Some(produced_type)) =
                (FlagType::of(existing), FlagType::of(value))
            && existing_type != produced_type
        {
            return Err(SchedulerError::FlagTypeConflict {
                stage,
                key: key.clone(),
                existing: existing_type,
                produced: produced_type,
            });
        }
    }
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn build_envelope(
    env: &RunEnv,
    state: &RunState,
    stage: Stage,
    cause: &SchedulerError,
) -> ErrorEnvelope {
    let stack = match cause {
        SchedulerError::Handler { stack, .. } => stack.clone(),
        _ => None,
    };
    let seed = state.data.get("seed");
    ErrorEnvelope {
        name: cause.kind().to_string(),
        message: cause.to_string(),
        stack,
        debug: Some(ErrorDebug {
            stage: stage.to_string(),
            previous_stage: state.last_stage.map(|s| s.to_string()),
            log_path: env
                .io
                .path_for(FileType::Logs, &format!("stage-{stage}.log"))
                .display()
                .to_string(),
            snapshot_path: env
                .io
                .path_for(FileType::Logs, &format!("stage-{stage}-context.json"))
                .display()
                .to_string(),
            data_has_seed: state.data.contains_key("seed"),
            seed_has_data: seed
                .map(|value| match value {
                    Value::Object(map) => !map.is_empty(),
                    Value::Null => false,
                    _ => true,
                })
                .unwrap_or(false),
            flags_keys: state.flags.keys().cloned().collect(),
        }),
    }
}
