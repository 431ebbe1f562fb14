//! Phase contracts: the static pre/postconditions of each task kind.
//!
//! | kind        | preconditions                 | postconditions                         |
//! |-------------|-------------------------------|----------------------------------------|
//! | `plan`      | none                          | `plan_path` artifact, `plan` result    |
//! | `implement` | `plan_path` artifact          | `implement` result                     |
//! | `verify`    | workspace directory exists    | `verify` result                        |
//! | `document`  | `implement` result present    | `document` result                      |
//! | `generic`   | none                          | `generic` result                       |
//!
//! Postconditions double as the idempotency check: a task whose outputs
//! already validate is complete and is not run again.

mod validator;

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::store::{Execution, TaskKind};

pub use validator::ContractValidator;

/// Artifacts smaller than this are treated as placeholders.
pub const MIN_ARTIFACT_BYTES: u64 = 64;

pub const PLAN_ARTIFACT: &str = "plan_path";

/// One predicate over an execution and the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The artifact key names a file of at least `min_bytes`.
    ArtifactResolves { key: &'static str, min_bytes: u64 },
    /// A result record exists for the kind (any value).
    ResultPresent(TaskKind),
    /// A result record exists for the kind and is not empty.
    ResultNonEmpty(TaskKind),
    /// The execution's workspace directory exists.
    WorkspaceExists,
}

#[derive(Debug)]
pub struct PhaseContract {
    pub kind: TaskKind,
    pub preconditions: &'static [Condition],
    pub postconditions: &'static [Condition],
}

const PLAN_RESOLVES: Condition = Condition::ArtifactResolves {
    key: PLAN_ARTIFACT,
    min_bytes: MIN_ARTIFACT_BYTES,
};

static PLAN: PhaseContract = PhaseContract {
    kind: TaskKind::Plan,
    preconditions: &[],
    postconditions: &[PLAN_RESOLVES, Condition::ResultNonEmpty(TaskKind::Plan)],
};

static IMPLEMENT: PhaseContract = PhaseContract {
    kind: TaskKind::Implement,
    preconditions: &[PLAN_RESOLVES],
    postconditions: &[Condition::ResultNonEmpty(TaskKind::Implement)],
};

static VERIFY: PhaseContract = PhaseContract {
    kind: TaskKind::Verify,
    preconditions: &[Condition::WorkspaceExists],
    postconditions: &[Condition::ResultNonEmpty(TaskKind::Verify)],
};

static DOCUMENT: PhaseContract = PhaseContract {
    kind: TaskKind::Document,
    preconditions: &[Condition::ResultPresent(TaskKind::Implement)],
    postconditions: &[Condition::ResultNonEmpty(TaskKind::Document)],
};

static GENERIC: PhaseContract = PhaseContract {
    kind: TaskKind::Generic,
    preconditions: &[],
    postconditions: &[Condition::ResultNonEmpty(TaskKind::Generic)],
};

pub fn contract_for(kind: TaskKind) -> &'static PhaseContract {
    match kind {
        TaskKind::Plan => &PLAN,
        TaskKind::Implement => &IMPLEMENT,
        TaskKind::Verify => &VERIFY,
        TaskKind::Document => &DOCUMENT,
        TaskKind::Generic => &GENERIC,
    }
}

impl Condition {
    /// Whether the answer can change once a workspace is allocated: the
    /// workspace check itself, and recorded artifacts with relative paths.
    pub fn depends_on_workspace(&self, execution: &Execution) -> bool {
        match *self {
            Condition::WorkspaceExists => true,
            Condition::ArtifactResolves { key, .. } => execution
                .metadata
                .artifact(key)
                .is_some_and(|raw| Path::new(raw).is_relative()),
            Condition::ResultPresent(_) | Condition::ResultNonEmpty(_) => false,
        }
    }

    /// Evaluate against `execution`. Relative artifact paths resolve against
    /// the workspace, or `base_dir` when there is none.
    pub fn check(&self, execution: &Execution, base_dir: &Path) -> Result<(), String> {
        match *self {
            Condition::ArtifactResolves { key, min_bytes } => {
                let Some(raw) = execution.metadata.artifact(key) else {
                    return Err(format!("artifact '{}' is not recorded", key));
                };
                let path = resolve_artifact(raw, execution, base_dir);
                let meta = std::fs::metadata(&path).map_err(|_| {
                    format!("artifact '{}' does not exist at {}", key, path.display())
                })?;
                if !meta.is_file() {
                    return Err(format!("artifact '{}' at {} is not a file", key, path.display()));
                }
                if meta.len() < min_bytes {
                    return Err(format!(
                        "artifact '{}' is {} bytes, expected at least {}",
                        key,
                        meta.len(),
                        min_bytes
                    ));
                }
                Ok(())
            }
            Condition::ResultPresent(kind) => match execution.metadata.result(kind) {
                Some(_) => Ok(()),
                None => Err(format!("no '{}' result recorded", kind)),
            },
            Condition::ResultNonEmpty(kind) => match execution.metadata.result(kind) {
                None => Err(format!("no '{}' result recorded", kind)),
                Some(v) if is_empty_value(v) => Err(format!("'{}' result is empty", kind)),
                Some(_) => Ok(()),
            },
            Condition::WorkspaceExists => match &execution.workspace_path {
                Some(p) if Path::new(p).is_dir() => Ok(()),
                Some(p) => Err(format!("workspace {} does not exist", p)),
                None => Err("no workspace recorded".to_string()),
            },
        }
    }
}

fn resolve_artifact(raw: &str, execution: &Execution, base_dir: &Path) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match &execution.workspace_path {
        Some(ws) => Path::new(ws).join(path),
        None => base_dir.join(path),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Violations among `conditions`, in order.
pub fn evaluate(conditions: &[Condition], execution: &Execution, base_dir: &Path) -> Vec<String> {
    conditions
        .iter()
        .filter_map(|c| c.check(execution, base_dir).err())
        .collect()
}

pub fn check_inputs(kind: TaskKind, execution: &Execution, base_dir: &Path) -> Vec<String> {
    evaluate(contract_for(kind).preconditions, execution, base_dir)
}

/// Preconditions that fail regardless of the workspace, so a launch can be
/// refused before anything is allocated.
pub fn check_inputs_before_allocation(kind: TaskKind, execution: &Execution, base_dir: &Path) -> Vec<String> {
    contract_for(kind)
        .preconditions
        .iter()
        .filter(|c| !c.depends_on_workspace(execution))
        .filter_map(|c| c.check(execution, base_dir).err())
        .collect()
}

pub fn check_outputs(kind: TaskKind, execution: &Execution, base_dir: &Path) -> Vec<String> {
    evaluate(contract_for(kind).postconditions, execution, base_dir)
}
