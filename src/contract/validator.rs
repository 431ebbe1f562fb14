use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use super::{check_inputs, check_inputs_before_allocation, check_outputs};
use crate::errors::OrchestrationError;
use crate::store::{DbHandle, Execution, Task, TaskKind};

/// Checks phase contracts against stored executions.
#[derive(Clone)]
pub struct ContractValidator {
    db: DbHandle,
    base_dir: PathBuf,
}

impl ContractValidator {
    /// `base_dir` anchors relative artifact paths of executions without a
    /// workspace.
    pub fn new(db: DbHandle, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_dir: base_dir.into(),
        }
    }

    /// Unmet preconditions for `kind` on this execution. An unknown
    /// execution is itself a violation.
    pub async fn validate_inputs(&self, kind: TaskKind, execution_id: &str) -> Result<Vec<String>> {
        self.evaluate(kind, execution_id, "inputs", check_inputs).await
    }

    /// Unmet postconditions for `kind` on this execution.
    pub async fn validate_outputs(&self, kind: TaskKind, execution_id: &str) -> Result<Vec<String>> {
        self.evaluate(kind, execution_id, "outputs", check_outputs).await
    }

    /// True iff the outputs already validate, so the work must not run again.
    pub async fn is_already_complete(&self, kind: TaskKind, execution_id: &str) -> Result<bool> {
        Ok(self.validate_outputs(kind, execution_id).await?.is_empty())
    }

    /// Fail fast before launch with a typed error carrying every violation.
    pub async fn require_inputs(&self, task: &Task, execution_id: &str) -> Result<(), OrchestrationError> {
        let violations = self.validate_inputs(task.kind, execution_id).await?;
        precondition_result(task, violations)
    }

    /// [`require_inputs`](Self::require_inputs) restricted to conditions a
    /// workspace cannot change. Run before anything is allocated.
    pub async fn require_inputs_before_allocation(
        &self,
        task: &Task,
        execution_id: &str,
    ) -> Result<(), OrchestrationError> {
        let violations = self
            .evaluate(task.kind, execution_id, "unallocated inputs", check_inputs_before_allocation)
            .await?;
        precondition_result(task, violations)
    }

    async fn evaluate(
        &self,
        kind: TaskKind,
        execution_id: &str,
        stage: &'static str,
        checks: fn(TaskKind, &Execution, &Path) -> Vec<String>,
    ) -> Result<Vec<String>> {
        let id = execution_id.to_string();
        let Some(execution) = self.db.call(move |db| db.get_execution(&id)).await? else {
            return Ok(vec![format!("execution {} not found", execution_id)]);
        };
        let base_dir = self.base_dir.clone();
        let violations = tokio::task::spawn_blocking(move || checks(kind, &execution, &base_dir)).await?;
        debug!(execution_id, %kind, stage, violations = violations.len(), "Evaluated phase contract");
        Ok(violations)
    }
}

fn precondition_result(task: &Task, violations: Vec<String>) -> Result<(), OrchestrationError> {
    if violations.is_empty() {
        return Ok(());
    }
    Err(OrchestrationError::PreconditionFailure {
        task_id: task.task_id,
        kind: task.kind.to_string(),
        violations,
    })
}
