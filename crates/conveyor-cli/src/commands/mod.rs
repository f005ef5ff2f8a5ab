//! CLI command implementations.

use anyhow::Context;
use conveyor_config::{LifecyclePaths, load_pipeline};
use conveyor_state::{STATUS_FILE, read_status};
use std::path::Path;

mod run;
mod submit;

pub use run::run;
pub use submit::submit;

/// Parse and report on a pipeline definition.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)
        .with_context(|| format!("Failed to parse pipeline definition: {}", path.display()))?;

    println!("Pipeline: {}", pipeline.id);
    println!("Tasks: {}", pipeline.tasks.len());
    for task in &pipeline.tasks {
        match &task.module {
            Some(module) if !module.is_absolute() => println!(
                "  {} (module {} is not absolute; the supervisor will reject it)",
                task.name,
                module.display()
            ),
            Some(module) => println!("  {} (module {})", task.name, module.display()),
            None => println!("  {}", task.name),
        }
    }
    if let Some(max) = pipeline.max_refinements {
        println!("Max refinements: {max}");
    }
    Ok(())
}

/// Print a job's status document. Searches the lifecycle dirs in order.
pub async fn status(job_id: &str) -> anyhow::Result<()> {
    let paths = LifecyclePaths::from_env();
    for root in [&paths.current, &paths.complete, &paths.rejected] {
        let status_path = root.join(job_id).join(STATUS_FILE);
        if status_path.exists() {
            let doc = read_status(&status_path).await;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            return Ok(());
        }
    }
    anyhow::bail!("job {job_id:?} not found in any lifecycle directory");
}

/// List jobs in each lifecycle directory with their states.
pub async fn list() -> anyhow::Result<()> {
    let paths = LifecyclePaths::from_env();
    for (label, root) in [
        ("current", &paths.current),
        ("complete", &paths.complete),
        ("rejected", &paths.rejected),
    ] {
        println!("{label}:");
        let Ok(mut entries) = tokio::fs::read_dir(root).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let status_path = entry.path().join(STATUS_FILE);
            if !status_path.exists() {
                continue;
            }
            let doc = read_status(&status_path).await;
            let state = doc
                .state
                .map(|s| format!("{s:?}").to_lowercase())
                .unwrap_or_else(|| "unknown".to_string());
            let progress = doc
                .progress
                .map(|p| format!(" {p}%"))
                .unwrap_or_default();
            println!("  {} [{state}{progress}]", entry.file_name().to_string_lossy());
        }
    }
    Ok(())
}
