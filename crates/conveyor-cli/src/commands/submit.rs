//! Job intake command.

use anyhow::Context;
use conveyor_config::{LifecyclePaths, load_pipeline};
use conveyor_runner::create_job;
use std::path::Path;

/// Create the job skeleton (work dir, seed copy, initial status document)
/// under the current lifecycle dir.
pub async fn submit(job_id: &str, pipeline_path: &Path, seed_path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(pipeline_path).with_context(|| {
        format!(
            "Failed to parse pipeline definition: {}",
            pipeline_path.display()
        )
    })?;

    let seed_bytes = tokio::fs::read(seed_path)
        .await
        .with_context(|| format!("Failed to read seed: {}", seed_path.display()))?;
    let seed: serde_json::Value =
        serde_json::from_slice(&seed_bytes).context("Seed must be valid JSON")?;

    let paths = LifecyclePaths::from_env();
    create_job(&paths, job_id, &pipeline, &seed).await?;

    println!(
        "Submitted job {job_id} for pipeline {} at {}",
        pipeline.id,
        paths.job_dir(job_id).display()
    );
    Ok(())
}
