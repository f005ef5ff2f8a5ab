//! Pipeline definition parsing.
//!
//! A pipeline definition is a KDL document:
//!
//! ```kdl
//! pipeline "content-gen" {
//!     max-refinements 2
//!     task "research" module="/opt/handlers/research"
//!     task "draft"
//! }
//! ```
//!
//! `task` children give the ordered task list; `module` is the optional
//! handler-module path recorded for provenance (the supervisor requires it to
//! be absolute).

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{ConfigError, ConfigResult};

/// An ordered pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Identifier recorded as `pipelineId` in every status document.
    pub id: String,
    /// Tasks in execution order.
    pub tasks: Vec<TaskSpec>,
    /// Refinement budget used when the seed is silent.
    pub max_refinements: Option<u32>,
}

/// One task in a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Handler-module path, provenance only.
    pub module: Option<PathBuf>,
}

impl Pipeline {
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }
}

/// Parse a pipeline definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let node = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "pipeline")
        .ok_or_else(|| ConfigError::MissingField("pipeline".to_string()))?;

    let id = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("pipeline id".to_string()))?
        .to_string();

    let mut tasks = Vec::new();
    let mut max_refinements = None;

    for child in node.children().map(KdlDocument::nodes).unwrap_or_default() {
        match child.name().value() {
            "task" => {
                let name = first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("task name".to_string()))?
                    .to_string();
                if tasks.iter().any(|t: &TaskSpec| t.name == name) {
                    return Err(ConfigError::Duplicate(format!("task {name:?}")));
                }
                let module = property(child, "module").map(PathBuf::from);
                tasks.push(TaskSpec { name, module });
            }
            "max-refinements" => {
                let value = child
                    .entries()
                    .iter()
                    .find(|e| e.name().is_none())
                    .and_then(|e| e.value().as_integer())
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: "max-refinements".to_string(),
                        message: "expected an integer argument".to_string(),
                    })?;
                if value < 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "max-refinements".to_string(),
                        message: format!("must be non-negative, got {value}"),
                    });
                }
                max_refinements = Some(value as u32);
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "pipeline".to_string(),
                    message: format!("unknown child node {other:?}"),
                });
            }
        }
    }

    if tasks.is_empty() {
        return Err(ConfigError::MissingField("pipeline tasks".to_string()));
    }

    Ok(Pipeline {
        id,
        tasks,
        max_refinements,
    })
}

/// Read and parse a pipeline definition file.
pub fn load_pipeline(path: &Path) -> ConfigResult<Pipeline> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline(&content)
}

fn first_string_arg(node: &KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
}

fn property<'a>(node: &'a KdlNode, key: &str) -> Option<&'a str> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .and_then(|e| e.value().as_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
pipeline "content-gen" {
    max-refinements 2
    task "research" module="/opt/handlers/research"
    task "draft"
}
"#;

    #[test]
    fn parses_ordered_tasks() {
        let pipeline = parse_pipeline(EXAMPLE).unwrap();
        assert_eq!(pipeline.id, "content-gen");
        assert_eq!(pipeline.task_names(), vec!["research", "draft"]);
        assert_eq!(
            pipeline.tasks[0].module.as_deref(),
            Some(Path::new("/opt/handlers/research"))
        );
        assert!(pipeline.tasks[1].module.is_none());
        assert_eq!(pipeline.max_refinements, Some(2));
    }

    #[test]
    fn rejects_duplicate_tasks() {
        let kdl = r#"
pipeline "p" {
    task "a"
    task "a"
}
"#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn rejects_empty_pipelines() {
        assert!(matches!(
            parse_pipeline(r#"pipeline "p""#),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn rejects_missing_pipeline_node() {
        assert!(matches!(
            parse_pipeline(r#"node "p""#),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn rejects_negative_refinement_budget() {
        let kdl = r#"
pipeline "p" {
    max-refinements -1
    task "a"
}
"#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
