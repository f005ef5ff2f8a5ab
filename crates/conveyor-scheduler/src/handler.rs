//! Stage handlers, handler tables, and per-stage configuration.

use async_trait::async_trait;
use conveyor_core::Stage;
use conveyor_core::flags::{FlagMap, FlagType, needs_refinement};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::context::StageContext;

/// User-supplied function implementing one stage.
///
/// The returned value must decode to `{output, flags}`; the scheduler
/// enforces the contract, not the handler.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, ctx: StageContext) -> anyhow::Result<Value>;
}

/// Adapter implementing [`StageHandler`] for plain async functions.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> StageHandler for FnHandler<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn run(&self, ctx: StageContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async function as a shareable stage handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StageHandler>
where
    F: Fn(StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// The stage handlers of one task. Stages without a handler are recorded as
/// skipped.
#[derive(Default, Clone)]
pub struct TaskHandlers {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl TaskHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageHandler>> {
        self.handlers.get(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Handler tables for every task of a pipeline, bound in-process by the
/// caller.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskHandlers>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, task: impl Into<String>, handlers: TaskHandlers) -> Self {
        self.tasks.insert(task.into(), Arc::new(handlers));
        self
    }

    pub fn get(&self, task: &str) -> Option<Arc<TaskHandlers>> {
        self.tasks.get(task).cloned()
    }
}

/// Skip predicate over the accumulated flags.
pub type SkipPredicate = Arc<dyn Fn(&FlagMap) -> bool + Send + Sync>;

/// Optional per-stage configuration: skip predicate plus flag schemas.
#[derive(Default, Clone)]
pub struct StageSpec {
    pub skip_if: Option<SkipPredicate>,
    /// Prerequisite flag types, checked before invocation.
    pub requires: Option<HashMap<String, FlagType>>,
    /// Produced flag types, checked after invocation.
    pub produces: Option<HashMap<String, FlagType>>,
}

/// Per-stage configuration for a whole run.
#[derive(Clone)]
pub struct StagePlan {
    specs: HashMap<Stage, StageSpec>,
}

impl Default for StagePlan {
    /// The canonical plan: critique, refine and finalValidation skip unless
    /// `flags.needsRefinement === true`.
    fn default() -> Self {
        let unless_refining: SkipPredicate = Arc::new(|flags| !needs_refinement(flags));
        let mut specs = HashMap::new();
        for stage in [Stage::Critique, Stage::Refine, Stage::FinalValidation] {
            specs.insert(
                stage,
                StageSpec {
                    skip_if: Some(unless_refining.clone()),
                    ..StageSpec::default()
                },
            );
        }
        Self { specs }
    }
}

impl StagePlan {
    pub fn with_spec(mut self, stage: Stage, spec: StageSpec) -> Self {
        self.specs.insert(stage, spec);
        self
    }

    pub fn spec(&self, stage: Stage) -> Option<&StageSpec> {
        self.specs.get(&stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_plan_gates_refinement_stages() {
        let plan = StagePlan::default();
        let mut flags = FlagMap::new();

        for stage in [Stage::Critique, Stage::Refine, Stage::FinalValidation] {
            let skip = plan.spec(stage).unwrap().skip_if.as_ref().unwrap();
            assert!(skip(&flags), "{stage} should skip without the flag");
        }

        flags.insert("needsRefinement".into(), json!(true));
        for stage in [Stage::Critique, Stage::Refine, Stage::FinalValidation] {
            let skip = plan.spec(stage).unwrap().skip_if.as_ref().unwrap();
            assert!(!skip(&flags), "{stage} should run once flagged");
        }

        assert!(plan.spec(Stage::Inference).is_none());
    }
}
