use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Ready,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Queued,
        Self::Ready,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Edges of the task state machine. Anything else is a programming error.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Queued, Ready)
            | (Queued, Blocked)
            | (Ready, Running)
            | (Ready, Failed)
            | (Ready, Blocked)
            | (Running, Completed)
            | (Running, Ready)
            | (Running, Queued)
            | (Running, Failed)
            | (Running, Blocked)
    )
}

/// Kind of work a task performs; selects its phase contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Plan,
    Implement,
    Verify,
    Document,
    #[default]
    Generic,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Verify => "verify",
            Self::Document => "document",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "implement" => Ok(Self::Implement),
            "verify" => Ok(Self::Verify),
            "document" => Ok(Self::Document),
            "generic" => Ok(Self::Generic),
            _ => Err(format!("Invalid task kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    InProgress,
    Completed,
    Aborted,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl FromStr for FeatureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Invalid feature status: {}", s)),
        }
    }
}

/// Planned task as submitted with a feature. `depends_on` holds sequence
/// numbers within the same feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub sequence_number: i64,
    pub title: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<i64>,
}

impl TaskSpec {
    pub fn new(sequence_number: i64, title: &str, depends_on: Vec<i64>) -> Self {
        Self {
            sequence_number,
            title: title.to_string(),
            kind: TaskKind::Generic,
            payload: String::new(),
            priority: 0,
            depends_on,
        }
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: &str) -> Self {
        self.payload = payload.to_string();
        self
    }
}

/// A feature file accepted by `submit_feature`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub feature_id: String,
    #[serde(default)]
    pub title: String,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub feature_id: String,
    pub sequence_number: i64,
    pub title: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub depends_on: Vec<i64>,
    pub payload: String,
    pub priority: i32,
    pub external_ref: Option<String>,
    pub execution_ref: Option<String>,
    pub created_at: String,
    pub ready_at: Option<String>,
    pub started_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub feature_id: String,
    pub title: String,
    pub status: FeatureStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Per-status task counts for a feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeatureProgress {
    pub total: usize,
    pub counts: BTreeMap<String, usize>,
}

impl FeatureProgress {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn all_terminal(&self) -> bool {
        self.total > 0
            && self.count(TaskStatus::Completed)
                + self.count(TaskStatus::Failed)
                + self.count(TaskStatus::Blocked)
                == self.total
    }

    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.count(TaskStatus::Completed) == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub backend: u16,
    pub frontend: u16,
}

/// Keys that belong to the task record and must never be mirrored into
/// execution metadata.
pub const COORDINATION_KEYS: &[&str] = &[
    "status",
    "attempt_count",
    "depends_on",
    "priority",
    "ready_at",
];

/// Free-form per-execution metadata. Coordination state lives solely on
/// the task record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMetadata {
    /// Produced artifact paths keyed by name (e.g. `plan_path`).
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Structured result records keyed by task kind.
    #[serde(default)]
    pub results: BTreeMap<String, serde_json::Value>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionMetadata {
    pub fn artifact(&self, key: &str) -> Option<&str> {
        self.artifacts.get(key).map(String::as_str)
    }

    pub fn result(&self, kind: TaskKind) -> Option<&serde_json::Value> {
        self.results.get(kind.as_str())
    }

    pub fn set_artifact(&mut self, key: &str, path: &str) {
        self.artifacts.insert(key.to_string(), path.to_string());
    }

    pub fn set_result(&mut self, kind: TaskKind, value: serde_json::Value) {
        self.results.insert(kind.as_str().to_string(), value);
    }

    pub fn insert_extra(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        if COORDINATION_KEYS.contains(&key) {
            bail!("'{}' is coordination state and lives on the task record", key);
        }
        self.extra.insert(key.to_string(), value);
        Ok(())
    }

    /// Reject metadata that duplicates coordination fields.
    pub fn check_single_writer(&self) -> Result<()> {
        if let Some(key) = COORDINATION_KEYS
            .iter()
            .find(|k| self.extra.contains_key(**k))
        {
            bail!("Execution metadata must not carry coordination key '{}'", key);
        }
        Ok(())
    }

    /// Fold another execution's artifacts and results into this one.
    /// Existing keys win.
    pub fn inherit(&mut self, upstream: &ExecutionMetadata) {
        for (k, v) in &upstream.artifacts {
            self.artifacts.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &upstream.results {
            self.results.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Move `kind`'s result out of `results`, keeping it for inspection
    /// under `rejected_<kind>_result`. A rejected result never satisfies a
    /// postcondition.
    pub fn reject_result(&mut self, kind: TaskKind) -> bool {
        match self.results.remove(kind.as_str()) {
            Some(value) => {
                self.extra.insert(format!("rejected_{}_result", kind.as_str()), value);
                true
            }
            None => false,
        }
    }

    pub fn merge(&mut self, other: ExecutionMetadata) {
        self.artifacts.extend(other.artifacts);
        self.results.extend(other.results);
        self.extra.extend(other.extra);
    }
}

/// Runtime context for one launch of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub task_id: i64,
    pub workspace_path: Option<String>,
    pub ports: Option<PortPair>,
    pub branch_name: Option<String>,
    pub metadata: ExecutionMetadata,
    pub created_at: String,
    pub released_at: Option<String>,
}

/// One reservable slot of the port pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSlot {
    pub slot_index: u32,
    pub reserved_by: Option<String>,
    pub reserved_at: Option<String>,
}

/// Loop guard bookkeeping for one task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_count: u32,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
    }

    #[test]
    fn valid_transitions() {
        assert!(is_valid_transition(TaskStatus::Queued, TaskStatus::Ready));
        assert!(is_valid_transition(TaskStatus::Ready, TaskStatus::Running));
        assert!(is_valid_transition(TaskStatus::Running, TaskStatus::Ready));
        assert!(is_valid_transition(TaskStatus::Running, TaskStatus::Queued));
        assert!(is_valid_transition(TaskStatus::Ready, TaskStatus::Failed));
        assert!(is_valid_transition(TaskStatus::Running, TaskStatus::Blocked));
    }

    #[test]
    fn invalid_transitions() {
        assert!(!is_valid_transition(TaskStatus::Completed, TaskStatus::Running));
        assert!(!is_valid_transition(TaskStatus::Queued, TaskStatus::Running));
        assert!(!is_valid_transition(TaskStatus::Failed, TaskStatus::Ready));
        assert!(!is_valid_transition(TaskStatus::Blocked, TaskStatus::Ready));
    }

    #[test]
    fn task_kind_defaults_to_generic() {
        let spec: TaskSpec =
            serde_json::from_str(r#"{"sequence_number": 1, "title": "x"}"#).unwrap();
        assert_eq!(spec.kind, TaskKind::Generic);
        assert!(spec.depends_on.is_empty());
        assert_eq!(spec.priority, 0);
    }

    #[test]
    fn metadata_rejects_coordination_keys() {
        let mut meta = ExecutionMetadata::default();
        assert!(meta.insert_extra("status", serde_json::json!("running")).is_err());
        assert!(meta.insert_extra("log_path", serde_json::json!("/tmp/x")).is_ok());
        assert!(meta.check_single_writer().is_ok());

        let smuggled: ExecutionMetadata =
            serde_json::from_str(r#"{"status": "completed"}"#).unwrap();
        assert!(smuggled.check_single_writer().is_err());
    }

    #[test]
    fn rejected_result_is_kept_aside() {
        let mut meta = ExecutionMetadata::default();
        meta.set_result(TaskKind::Verify, serde_json::json!({"passed": 3, "failed": 2}));

        assert!(meta.reject_result(TaskKind::Verify));
        assert!(meta.result(TaskKind::Verify).is_none());
        assert_eq!(meta.extra["rejected_verify_result"]["failed"], 2);
        assert!(meta.check_single_writer().is_ok());
        assert!(!meta.reject_result(TaskKind::Verify));
    }

    #[test]
    fn metadata_serializes_flat_extras() {
        let mut meta = ExecutionMetadata::default();
        meta.set_artifact("plan_path", "/tmp/plan.md");
        meta.insert_extra("model", serde_json::json!("opus")).unwrap();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["artifacts"]["plan_path"], "/tmp/plan.md");
        assert_eq!(json["model"], "opus");
    }

    #[test]
    fn inherit_keeps_own_values() {
        let mut upstream = ExecutionMetadata::default();
        upstream.set_artifact("plan_path", "/up/plan.md");
        upstream.set_result(TaskKind::Plan, serde_json::json!({"steps": 3}));

        let mut own = ExecutionMetadata::default();
        own.set_artifact("plan_path", "/own/plan.md");
        own.inherit(&upstream);

        assert_eq!(own.artifact("plan_path"), Some("/own/plan.md"));
        assert_eq!(own.result(TaskKind::Plan).unwrap()["steps"], 3);
    }

    #[test]
    fn progress_terminal_and_completed() {
        let mut progress = FeatureProgress {
            total: 3,
            ..Default::default()
        };
        progress.counts.insert("completed".into(), 2);
        progress.counts.insert("failed".into(), 1);
        assert!(progress.all_terminal());
        assert!(!progress.all_completed());

        progress.counts.insert("completed".into(), 3);
        progress.counts.remove("failed");
        assert!(progress.all_completed());
    }
}
