//! The per-job status document.
//!
//! One JSON file per job (`tasks-status.json`) serializes all engine-visible
//! state. A missing or unparseable file decodes as [`StatusDocument::default`],
//! which is the empty-but-valid document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overall job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    Rejected,
}

/// State of one task within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    /// Terminal, but does not fail the job.
    Skipped,
}

/// File category under a job's `files/` tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FileType {
    #[display("artifacts")]
    Artifacts,
    #[display("logs")]
    Logs,
    #[display("tmp")]
    Tmp,
}

impl FileType {
    pub const ALL: [FileType; 3] = [FileType::Artifacts, FileType::Logs, FileType::Tmp];

    /// Directory name under `files/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            FileType::Artifacts => "artifacts",
            FileType::Logs => "logs",
            FileType::Tmp => "tmp",
        }
    }
}

/// Per-type inventories of file names, insertion-ordered and duplicate-free.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileInventory {
    pub artifacts: Vec<String>,
    pub logs: Vec<String>,
    pub tmp: Vec<String>,
}

impl FileInventory {
    pub fn list(&self, file_type: FileType) -> &[String] {
        match file_type {
            FileType::Artifacts => &self.artifacts,
            FileType::Logs => &self.logs,
            FileType::Tmp => &self.tmp,
        }
    }

    /// Record a name, preserving insertion order. Returns false if it was
    /// already present.
    pub fn record(&mut self, file_type: FileType, name: &str) -> bool {
        let list = match file_type {
            FileType::Artifacts => &mut self.artifacts,
            FileType::Logs => &mut self.logs,
            FileType::Tmp => &mut self.tmp,
        };
        if list.iter().any(|existing| existing == name) {
            false
        } else {
            list.push(name.to_string());
            true
        }
    }
}

/// One `[modelKey, inputTokens, outputTokens]` triple, appended to a task's
/// `tokenUsage` once per completed model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage(pub String, pub u64, pub u64);

impl TokenUsage {
    pub fn model_key(&self) -> &str {
        &self.0
    }

    pub fn input_tokens(&self) -> u64 {
        self.1
    }

    pub fn output_tokens(&self) -> u64 {
        self.2
    }
}

/// Normalized error envelope recorded on task failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorEnvelope {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<ErrorDebug>,
}

/// Debug payload attached to a stage failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorDebug {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_stage: Option<String>,
    pub log_path: String,
    pub snapshot_path: String,
    pub data_has_seed: bool,
    pub seed_has_data: bool,
    pub flags_keys: Vec<String>,
}

/// Per-task record inside the status document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRecord {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub refinement_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    /// Total handler execution time in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    pub artifacts: Vec<String>,
    pub token_usage: Vec<TokenUsage>,
    pub files: FileInventory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

impl TaskRecord {
    /// Record an artifact name, preserving insertion order without duplicates.
    pub fn record_artifact(&mut self, name: &str) {
        if !self.artifacts.iter().any(|existing| existing == name) {
            self.artifacts.push(name.to_string());
        }
    }
}

/// The per-job status document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    /// Currently executing task name; absent when idle or finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    /// Currently executing stage name within `current`. A free string, not a
    /// canonical stage: external mutators may write sub-stage markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub files: FileInventory,
}

impl StatusDocument {
    /// The record for `task`, created in its default pending shape on first
    /// access.
    pub fn task_mut(&mut self, task: &str) -> &mut TaskRecord {
        self.tasks.entry(task.to_string()).or_default()
    }

    /// Record a file name in the job-level inventory and, when `task` is
    /// given, in that task's inventory as well.
    pub fn record_file(&mut self, file_type: FileType, name: &str, task: Option<&str>) {
        self.files.record(file_type, name);
        if let Some(task) = task {
            self.task_mut(task).files.record(file_type, name);
        }
    }
}
