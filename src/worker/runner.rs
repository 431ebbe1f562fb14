use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use super::invoker::{AgentInvoker, InvocationOutput, InvocationRequest};
use crate::config::RemediationSection;
use crate::contract::{ContractValidator, PLAN_ARTIFACT};
use crate::remediation::{AgentRemediator, CommandCheck, RemediationLoop, RemediationOutcome};
use crate::store::{DbHandle, Execution, Task, TaskKind, TaskStatus};

/// How one run of a task ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Outputs already satisfied the contract; the worker was not invoked.
    Skipped,
    Succeeded {
        remediation: Option<RemediationOutcome>,
    },
    Failed {
        reason: String,
    },
}

impl RunOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            RunOutcome::Skipped | RunOutcome::Succeeded { .. } => TaskStatus::Completed,
            RunOutcome::Failed { .. } => TaskStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            RunOutcome::Failed { reason } => Some(reason.clone()),
            _ => None,
        }
    }
}

/// Executes one task inside its execution: skip if already done, invoke the
/// worker, record its outputs, remediate `verify` tasks, then check the
/// postconditions.
pub struct TaskRunner {
    db: DbHandle,
    validator: ContractValidator,
    invoker: Arc<dyn AgentInvoker>,
    remediation: RemediationSection,
    base_dir: PathBuf,
}

impl TaskRunner {
    pub fn new(
        db: DbHandle,
        validator: ContractValidator,
        invoker: Arc<dyn AgentInvoker>,
        remediation: RemediationSection,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            validator,
            invoker,
            remediation,
            base_dir: base_dir.into(),
        }
    }

    pub async fn run(&self, task: &Task, execution_id: &str) -> Result<RunOutcome> {
        let task_id = task.task_id;
        let current = self.db.call(move |db| db.get_task(task_id)).await?;
        if current.is_some_and(|t| t.status == TaskStatus::Completed)
            || self.validator.is_already_complete(task.kind, execution_id).await?
        {
            info!(task_id, execution_id, "Outputs already present, skipping worker");
            return Ok(RunOutcome::Skipped);
        }

        let id = execution_id.to_string();
        let execution = self
            .db
            .call(move |db| db.get_execution(&id))
            .await?
            .with_context(|| format!("Execution {} not found", execution_id))?;

        let request = InvocationRequest {
            task_id,
            execution_id: execution_id.to_string(),
            working_dir: execution
                .workspace_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.base_dir.clone()),
            prompt: build_prompt(task, &execution),
            ports: execution.ports,
        };

        let output = self.invoker.invoke(&request).await?;
        self.record_output(task, execution_id, &output).await?;
        if !output.success {
            return Ok(RunOutcome::Failed {
                reason: format!(
                    "worker exited with status {}: {}",
                    output.exit_code.map_or("unknown".to_string(), |c| c.to_string()),
                    last_line(&output.stderr)
                ),
            });
        }

        let mut remediation = None;
        if task.kind == TaskKind::Verify
            && let Some(check_cmd) = &self.remediation.check_cmd
        {
            let outcome = self.remediate(task, execution_id, &request, check_cmd).await?;
            if !outcome.succeeded() {
                let reason = match outcome.regression() {
                    Some(err) => err.to_string(),
                    None => format!(
                        "{} checks still failing after {} remediation iterations",
                        outcome.report.failed, outcome.iterations
                    ),
                };
                return Ok(RunOutcome::Failed { reason });
            }
            remediation = Some(outcome);
        }

        let violations = self.validator.validate_outputs(task.kind, execution_id).await?;
        if !violations.is_empty() {
            return Ok(RunOutcome::Failed {
                reason: format!("postconditions not met: {}", violations.join("; ")),
            });
        }
        Ok(RunOutcome::Succeeded { remediation })
    }

    /// Merge signals into the execution metadata and the status log.
    async fn record_output(&self, task: &Task, execution_id: &str, output: &InvocationOutput) -> Result<()> {
        let id = execution_id.to_string();
        let feature_id = task.feature_id.clone();
        let task_id = task.task_id;
        let kind = task.kind;
        let artifacts = output.artifacts.clone();
        let result = output.result.clone();
        let messages = output.messages.clone();
        self.db
            .call(move |db| {
                let execution = db
                    .get_execution(&id)?
                    .with_context(|| format!("Execution {} not found", id))?;
                let mut metadata = execution.metadata;
                for (key, path) in &artifacts {
                    metadata.set_artifact(key, path);
                }
                if let Some(result) = result {
                    metadata.set_result(kind, result);
                }
                db.update_execution_metadata(&id, &metadata)?;
                for message in &messages {
                    db.append_status_message(&feature_id, Some(task_id), message)?;
                }
                Ok(())
            })
            .await
    }

    async fn remediate(
        &self,
        task: &Task,
        execution_id: &str,
        request: &InvocationRequest,
        check_cmd: &str,
    ) -> Result<RemediationOutcome> {
        let check = CommandCheck::new(check_cmd, request.working_dir.clone());
        let remediator = AgentRemediator::new(
            self.invoker.clone(),
            InvocationRequest {
                prompt: format!("# {}\n\n{}", task.title, task.payload),
                ..request.clone()
            },
        );
        let outcome = RemediationLoop::new(&check, &remediator, self.remediation.max_iterations)
            .run()
            .await?;
        if let Some(err) = outcome.regression() {
            warn!(task_id = task.task_id, "{}", err);
        }

        let id = execution_id.to_string();
        let summary = json!({
            "passed": outcome.report.passed(),
            "failed": outcome.report.failed,
            "failing": outcome.report.failing(),
            "iterations": outcome.iterations,
            "stop": outcome.stop,
        });
        self.db
            .call(move |db| {
                let execution = db
                    .get_execution(&id)?
                    .with_context(|| format!("Execution {} not found", id))?;
                let mut metadata = execution.metadata;
                let report = metadata.result(TaskKind::Verify).cloned();
                let mut record = summary;
                if let Some(report) = report {
                    record["report"] = report;
                }
                metadata.set_result(TaskKind::Verify, record);
                db.update_execution_metadata(&id, &metadata)
            })
            .await?;
        Ok(outcome)
    }
}

/// Prompt handed to the worker: task description, upstream inputs and the
/// output tags the coordinator reads back.
pub fn build_prompt(task: &Task, execution: &Execution) -> String {
    let mut prompt = format!(
        "# {}\n\nFeature {}, task {} ({} phase).\n",
        task.title, task.feature_id, task.sequence_number, task.kind
    );
    if !task.payload.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str(task.payload.trim());
        prompt.push('\n');
    }

    let inputs = &execution.metadata;
    if !inputs.artifacts.is_empty() || !inputs.results.is_empty() {
        prompt.push_str("\n## Inputs from earlier tasks\n");
        for (key, path) in &inputs.artifacts {
            prompt.push_str(&format!("- artifact `{}`: {}\n", key, path));
        }
        for (kind, value) in &inputs.results {
            prompt.push_str(&format!("- {} result: {}\n", kind, value));
        }
    }

    // Tags are described by name only; a worker that echoes its prompt
    // must not report outputs it never produced.
    prompt.push_str("\n## Reporting\n");
    if task.kind == TaskKind::Plan {
        prompt.push_str(&format!(
            "Write the plan to a file and report its path in an `artifact` tag with key `{}`.\n",
            PLAN_ARTIFACT
        ));
    }
    prompt.push_str(
        "Report each produced file in an `artifact` tag whose `key` attribute names it.\n\
         Finish with a JSON summary of the work inside a `result` tag.\n\
         Post progress notes inside `status` tags.\n",
    );
    prompt
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutionMetadata, FeatureSpec, TaskSpec};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct FakeInvoker {
        calls: AtomicU32,
        output: InvocationOutput,
    }

    impl FakeInvoker {
        fn new(output: InvocationOutput) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                output,
            })
        }
    }

    #[async_trait]
    impl AgentInvoker for FakeInvoker {
        async fn invoke(&self, _request: &InvocationRequest) -> Result<InvocationOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    fn setup(kind: TaskKind) -> (DbHandle, Task) {
        let db = DbHandle::in_memory().unwrap();
        let task = {
            let store = db.lock_sync().unwrap();
            let tasks = store
                .submit_feature(&FeatureSpec {
                    feature_id: "f".into(),
                    title: String::new(),
                    tasks: vec![TaskSpec::new(1, "Do the thing", vec![]).with_kind(kind)],
                })
                .unwrap();
            store
                .create_execution("e1", tasks[0].task_id, &ExecutionMetadata::default())
                .unwrap();
            tasks[0].clone()
        };
        (db, task)
    }

    fn runner(db: &DbHandle, invoker: Arc<dyn AgentInvoker>, dir: &TempDir, check: Option<&str>) -> TaskRunner {
        TaskRunner::new(
            db.clone(),
            ContractValidator::new(db.clone(), dir.path()),
            invoker,
            RemediationSection {
                max_iterations: 2,
                check_cmd: check.map(String::from),
            },
            dir.path(),
        )
    }

    fn success_with_result() -> InvocationOutput {
        InvocationOutput {
            success: true,
            exit_code: Some(0),
            result: Some(json!({"done": true})),
            messages: vec!["halfway".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_run_performs_no_invocation() {
        let dir = TempDir::new().unwrap();
        let (db, task) = setup(TaskKind::Generic);
        let invoker = FakeInvoker::new(success_with_result());
        let runner = runner(&db, invoker.clone(), &dir, None);

        assert!(matches!(
            runner.run(&task, "e1").await.unwrap(),
            RunOutcome::Succeeded { .. }
        ));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);

        assert!(matches!(runner.run(&task, "e1").await.unwrap(), RunOutcome::Skipped));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_task_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (db, task) = setup(TaskKind::Generic);
        {
            let store = db.lock_sync().unwrap();
            store.transition(task.task_id, TaskStatus::Ready, TaskStatus::Running).unwrap();
            store.transition(task.task_id, TaskStatus::Running, TaskStatus::Completed).unwrap();
        }
        let invoker = FakeInvoker::new(success_with_result());
        let outcome = runner(&db, invoker.clone(), &dir, None).run(&task, "e1").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_outputs_and_status_are_recorded() {
        let dir = TempDir::new().unwrap();
        let (db, task) = setup(TaskKind::Generic);
        let mut output = success_with_result();
        output.artifacts = BTreeMap::from([("notes".to_string(), "notes.md".to_string())]);
        runner(&db, FakeInvoker::new(output), &dir, None)
            .run(&task, "e1")
            .await
            .unwrap();

        let store = db.lock_sync().unwrap();
        let exec = store.get_execution("e1").unwrap().unwrap();
        assert_eq!(exec.metadata.artifact("notes"), Some("notes.md"));
        assert_eq!(exec.metadata.result(TaskKind::Generic), Some(&json!({"done": true})));
        assert_eq!(store.recent_status_messages("f", 5).unwrap(), vec!["halfway".to_string()]);
    }

    #[tokio::test]
    async fn test_worker_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let (db, task) = setup(TaskKind::Generic);
        let output = InvocationOutput {
            success: false,
            exit_code: Some(1),
            stderr: "warming up\nout of credits\n".into(),
            ..Default::default()
        };
        let outcome = runner(&db, FakeInvoker::new(output), &dir, None)
            .run(&task, "e1")
            .await
            .unwrap();
        assert_eq!(outcome.status(), TaskStatus::Failed);
        assert_eq!(
            outcome.error().as_deref(),
            Some("worker exited with status 1: out of credits")
        );
    }

    #[tokio::test]
    async fn test_missing_postconditions_fail_loud() {
        let dir = TempDir::new().unwrap();
        let (db, task) = setup(TaskKind::Generic);
        let output = InvocationOutput {
            success: true,
            ..Default::default()
        };
        let outcome = runner(&db, FakeInvoker::new(output), &dir, None)
            .run(&task, "e1")
            .await
            .unwrap();
        match outcome {
            RunOutcome::Failed { reason } => assert!(reason.contains("postconditions not met")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_verify_runs_remediation_and_fails_without_progress() {
        let dir = TempDir::new().unwrap();
        let (db, task) = setup(TaskKind::Verify);
        let mut output = success_with_result();
        output.resolved = Some(1);
        let invoker = FakeInvoker::new(output);
        let outcome = runner(
            &db,
            invoker.clone(),
            &dir,
            Some("echo 'test a ... FAILED'; exit 101"),
        )
        .run(&task, "e1")
        .await
        .unwrap();

        match outcome {
            RunOutcome::Failed { reason } => assert!(reason.contains("no measured progress"), "{}", reason),
            other => panic!("unexpected outcome: {:?}", other),
        }
        // One task invocation plus one remediation attempt.
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);

        let exec = db.lock_sync().unwrap().get_execution("e1").unwrap().unwrap();
        let verify = exec.metadata.result(TaskKind::Verify).unwrap();
        assert_eq!(verify["failed"], 1);
        assert_eq!(verify["report"], json!({"done": true}));
    }

    #[tokio::test]
    async fn test_verify_with_passing_check_succeeds() {
        let dir = TempDir::new().unwrap();
        let (db, task) = setup(TaskKind::Verify);
        let outcome = runner(&db, FakeInvoker::new(success_with_result()), &dir, Some("echo 'test a ... ok'"))
            .run(&task, "e1")
            .await
            .unwrap();
        match outcome {
            RunOutcome::Succeeded { remediation: Some(r) } => assert!(r.succeeded()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_prompt_describes_tags_without_emitting_them() {
        let (db, task) = setup(TaskKind::Plan);
        let mut exec = db.lock_sync().unwrap().get_execution("e1").unwrap().unwrap();
        exec.metadata.set_result(TaskKind::Implement, json!({"x": 1}));
        let prompt = build_prompt(&task, &exec);
        assert!(prompt.starts_with("# Do the thing"));
        assert!(prompt.contains("implement result"));
        assert!(prompt.contains("key `plan_path`"));
        assert!(prompt.contains("`result` tag"));
        // echoing the prompt back reports nothing
        assert!(crate::worker::OutputParser::parse(&prompt).is_empty());
    }
}
