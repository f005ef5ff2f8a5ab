//! Local job supervision command.

use anyhow::Context;
use conveyor_config::{LifecyclePaths, Pipeline, load_pipeline};
use conveyor_core::Stage;
use conveyor_runner::{RunnerError, Supervisor};
use conveyor_scheduler::{StageContext, TaskHandlers, TaskRegistry, handler_fn};
use serde_json::json;
use std::path::Path;

/// Exit code for an interrupted run (SIGINT).
const EXIT_INTERRUPT: i32 = 130;
/// Exit code for a terminated run (SIGTERM).
const EXIT_TERMINATED: i32 = 143;

/// Supervise one job; returns the process exit code.
///
/// Signal handling drops the in-flight run future, which removes the PID
/// file through its guard before the process exits with the conventional
/// code.
pub async fn run(job_id: &str, pipeline_path: &Path) -> anyhow::Result<i32> {
    let pipeline = load_pipeline(pipeline_path).with_context(|| {
        format!(
            "Failed to parse pipeline definition: {}",
            pipeline_path.display()
        )
    })?;

    println!("Running job: {job_id}");
    println!("Pipeline: {} ({} tasks)", pipeline.id, pipeline.tasks.len());

    let paths = LifecyclePaths::from_env();
    let registry = passthrough_registry(&pipeline);
    let supervisor = Supervisor::new(paths, pipeline, registry);

    tokio::select! {
        result = supervisor.run_job(job_id) => match result {
            Ok(summary) => {
                println!("\n✓ Job promoted to complete/");
                println!(
                    "  tasks: {:?}, execution time: {}ms, refinements: {}",
                    summary.tasks, summary.total_execution_time, summary.total_refinement_attempts
                );
                Ok(0)
            }
            Err(RunnerError::TaskFailed { task, stage, envelope }) => {
                eprintln!("\n✗ Task '{task}' failed in stage '{stage}'");
                eprintln!("  {}: {}", envelope.name, envelope.message);
                eprintln!("  Working directory retained under current/ for inspection");
                Ok(1)
            }
            Err(other) => Err(other.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted");
            Ok(EXIT_INTERRUPT)
        }
        _ = terminate_signal() => {
            eprintln!("\nTerminated");
            Ok(EXIT_TERMINATED)
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}

/// Identity handler table used when no embedding application registers real
/// stage handlers: every task ingests its input unchanged and integrates the
/// accumulated data keys. Lets a pipeline be exercised end-to-end from the
/// command line.
fn passthrough_registry(pipeline: &Pipeline) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for task in &pipeline.tasks {
        let handlers = TaskHandlers::new()
            .with_stage(
                Stage::Ingestion,
                handler_fn(|ctx: StageContext| async move {
                    Ok(json!({ "output": ctx.output, "flags": {} }))
                }),
            )
            .with_stage(
                Stage::Integration,
                handler_fn(|ctx: StageContext| async move {
                    ctx.log.info("passthrough integration");
                    Ok(json!({
                        "output": { "integrated": ctx.data.keys().collect::<Vec<_>>() },
                        "flags": {},
                    }))
                }),
            );
        registry = registry.register(&task.name, handlers);
    }
    registry
}
