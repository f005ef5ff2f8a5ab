//! Job progress as an integer percentage.

use crate::stage::Stage;

/// Map (ordered task list, current task, current stage) to a percentage.
///
/// Each of the canonical stages of each task counts as one step; the current
/// stage counts as completed because progress is computed after a stage
/// finishes. Unknown task or stage names collapse to index zero.
pub fn progress_percent(
    tasks: &[String],
    current_task: Option<&str>,
    current_stage: Option<&str>,
) -> u8 {
    let stage_count = Stage::ALL.len();
    let total_steps = (tasks.len() * stage_count).max(1);

    let task_idx = current_task
        .and_then(|task| tasks.iter().position(|t| t == task))
        .unwrap_or(0);
    let stage_idx = current_stage
        .and_then(|stage| Stage::ALL.iter().position(|s| s.as_str() == stage))
        .unwrap_or(0);

    let completed_steps = task_idx * stage_count + stage_idx + 1;
    let percent = (completed_steps as f64 / total_steps as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}
