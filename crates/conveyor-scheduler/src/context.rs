//! The immutable snapshot handed to each stage handler.

use conveyor_core::Stage;
use conveyor_core::flags::FlagMap;
use conveyor_state::TaskIo;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::logger::StageLogger;
use crate::model::ModelBus;

/// Run-constant metadata shared by every stage of one task run.
#[derive(Debug, Clone)]
pub struct StageMeta {
    pub task: String,
    pub job_id: String,
    pub work_dir: PathBuf,
    pub status_path: PathBuf,
    /// Forwarded from the seed untouched.
    pub model_config: Value,
    /// Ordered task list of the pipeline definition.
    pub pipeline_tasks: Vec<String>,
    pub pipeline_id: String,
}

/// Per-stage input snapshot.
///
/// `data` and `flags` are deep copies; handler mutations do not leak into
/// the engine's accumulated state. Only the returned `{output, flags}` does.
pub struct StageContext {
    pub meta: Arc<StageMeta>,
    /// Stage outputs so far, keyed by stage name, plus `seed` and prior
    /// tasks' outputs keyed by task name.
    pub data: Map<String, Value>,
    pub flags: FlagMap,
    pub current_stage: Stage,
    /// Last non-validation executed stage, if any.
    pub previous_stage: Option<Stage>,
    /// Output of the last non-validation executed stage, seeded from `seed`.
    pub output: Value,
    pub io: TaskIo,
    pub llm: ModelBus,
    pub validators: Validators,
    pub log: StageLogger,
}

/// Structural validation helpers exposed to handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validators;

impl Validators {
    /// A map literal: not an array, not null, not a scalar.
    pub fn is_plain_object(&self, value: &Value) -> bool {
        value.is_object()
    }

    /// Check that `value` is an object containing every key in `keys`;
    /// returns the missing keys otherwise.
    pub fn require_keys(&self, value: &Value, keys: &[&str]) -> Result<(), Vec<String>> {
        let Some(map) = value.as_object() else {
            return Err(keys.iter().map(|k| k.to_string()).collect());
        };
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !map.contains_key(**k))
            .map(|k| k.to_string())
            .collect();
        if missing.is_empty() { Ok(()) } else { Err(missing) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validators_check_shape_and_keys() {
        let validators = Validators;
        assert!(validators.is_plain_object(&json!({})));
        assert!(!validators.is_plain_object(&json!([1, 2])));
        assert!(!validators.is_plain_object(&json!(null)));

        assert!(validators.require_keys(&json!({"a": 1, "b": 2}), &["a"]).is_ok());
        assert_eq!(
            validators.require_keys(&json!({"a": 1}), &["a", "b"]),
            Err(vec!["b".to_string()])
        );
    }
}
