use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Coordinator, Notice};
use crate::errors::{OrchestrationError, TerminalSummary};
use crate::guard::GuardDecision;
use crate::store::{Execution, ExecutionMetadata, PortPair, Task, TaskStatus};
use crate::workspace::{branch_name, preserve_artifacts};

/// What one call to [`Coordinator::launch`] did with a `ready` task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The worker was started; the task is `running`.
    Launched { execution_id: String },
    /// A previous execution's outputs already validate; the task went
    /// straight to `completed` without a worker.
    AlreadyComplete,
    /// A recent failure is still cooling down.
    CoolingDown,
    /// Another caller claimed the task first.
    Lost,
    /// Resources were unavailable or the worker failed to start; the task
    /// went back to `ready` (or `queued`) and will be picked up by a later
    /// event.
    Deferred { reason: String },
    /// Preconditions failed; the task is now `blocked` and its attempt was
    /// refunded.
    Blocked { reason: String },
    /// The attempt budget is spent; the task is now `failed`.
    Exhausted,
}

impl Coordinator {
    /// Launch a `ready` task.
    ///
    /// The Loop Guard is consulted first, then the task is claimed with a
    /// conditional `ready -> running` update so concurrent callers launch it
    /// at most once. Everything after the claim either hands the task to a
    /// worker or puts it back.
    pub async fn launch(&self, task: &Task) -> Result<LaunchOutcome> {
        let task_id = task.task_id;
        let attempt = match self.guard.check_and_increment(task_id).await? {
            GuardDecision::Proceed { attempt } => attempt,
            GuardDecision::CoolingDown { remaining } => {
                debug!(task_id, remaining_secs = remaining.as_secs(), "Task is cooling down");
                return Ok(LaunchOutcome::CoolingDown);
            }
            GuardDecision::Exhausted { attempts } => {
                if self.transition(task_id, TaskStatus::Ready, TaskStatus::Failed).await? {
                    let err = OrchestrationError::LoopExceeded { task_id, attempts };
                    self.fail_permanently(task, &err).await;
                }
                return Ok(LaunchOutcome::Exhausted);
            }
        };

        if !self.transition(task_id, TaskStatus::Ready, TaskStatus::Running).await? {
            self.guard.refund(task_id).await?;
            debug!(task_id, "Task already claimed");
            return Ok(LaunchOutcome::Lost);
        }

        match self.launch_claimed(task, attempt).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(task_id, "Launch aborted, returning task to ready: {:#}", e);
                if let Err(revert) = self.transition(task_id, TaskStatus::Running, TaskStatus::Ready).await {
                    warn!(task_id, "Failed to return task to ready: {:#}", revert);
                }
                if let Err(refund) = self.guard.refund(task_id).await {
                    warn!(task_id, "Failed to refund attempt: {:#}", refund);
                }
                Err(e)
            }
        }
    }

    async fn launch_claimed(&self, task: &Task, attempt: u32) -> Result<LaunchOutcome> {
        if let Some(previous) = &task.execution_ref
            && self.validator.is_already_complete(task.kind, previous).await?
        {
            return self.complete_without_worker(task, previous).await;
        }

        let execution = self.open_execution(task).await?;
        let execution_id = execution.execution_id.clone();
        match self.start(task, &execution_id, attempt).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.release_resources(&execution_id).await;
                self.discard_execution(task, &execution_id).await;
                Err(e)
            }
        }
    }

    async fn start(&self, task: &Task, execution_id: &str, attempt: u32) -> Result<LaunchOutcome> {
        let task_id = task.task_id;
        let branch = branch_name(&task.feature_id, task.sequence_number, &task.title);

        match self.validator.require_inputs_before_allocation(task, execution_id).await {
            Ok(()) => {}
            Err(err @ OrchestrationError::PreconditionFailure { .. }) => {
                return self.park(task, execution_id, err).await;
            }
            Err(err) => return Err(err.into()),
        }

        self.ensure_work_item(task).await;

        match self.reserve_resources(execution_id, &branch).await {
            Ok(_) => {}
            Err(err @ OrchestrationError::ResourceExhausted { .. }) => {
                self.guard.refund(task_id).await?;
                return self.defer(task, execution_id, TaskStatus::Ready, &err.to_string()).await;
            }
            Err(err @ OrchestrationError::AllocationFailure { .. }) => {
                // counts as a failed attempt so the cooldown spaces out retries
                self.guard.record_failure(task_id).await?;
                return self.defer(task, execution_id, TaskStatus::Ready, &err.to_string()).await;
            }
            Err(err) => return Err(err.into()),
        }

        // only workspace-dependent conditions can fail here, so the
        // allocation is what went wrong
        match self.validator.require_inputs(task, execution_id).await {
            Ok(()) => {}
            Err(err @ OrchestrationError::PreconditionFailure { .. }) => {
                self.guard.record_failure(task_id).await?;
                return self.defer(task, execution_id, TaskStatus::Ready, &err.to_string()).await;
            }
            Err(err) => return Err(err.into()),
        }

        let id = execution_id.to_string();
        let execution = self
            .db
            .call(move |db| db.get_execution(&id))
            .await?
            .with_context(|| format!("Execution {} vanished during launch", execution_id))?;

        if let Err(e) = self.launcher.launch(task, &execution).await {
            self.guard.refund(task_id).await?;
            return self
                .defer(task, execution_id, TaskStatus::Queued, &format!("worker launch failed: {:#}", e))
                .await;
        }

        let max = self.guard.max_attempts();
        self.post(
            &task.feature_id,
            Some(task_id),
            format!(
                "launched task {} '{}' (attempt {}/{}) in execution {}",
                task.sequence_number, task.title, attempt, max, execution_id
            ),
        )
        .await;
        self.notify(Notice::TaskLaunched {
            task_id,
            feature_id: task.feature_id.clone(),
            execution_id: execution_id.to_string(),
        });
        info!(
            task_id,
            feature_id = %task.feature_id,
            execution_id,
            attempt,
            backend_port = execution.ports.map(|p| p.backend),
            "Task launched"
        );
        Ok(LaunchOutcome::Launched {
            execution_id: execution_id.to_string(),
        })
    }

    /// Undo a claim that could not be handed to a worker.
    async fn defer(&self, task: &Task, execution_id: &str, back_to: TaskStatus, reason: &str) -> Result<LaunchOutcome> {
        self.release_resources(execution_id).await;
        self.discard_execution(task, execution_id).await;
        if !self.transition(task.task_id, TaskStatus::Running, back_to).await? {
            warn!(task_id = task.task_id, "Task left running state while deferring");
        }
        info!(task_id = task.task_id, to = %back_to, "Launch deferred: {}", reason);
        self.post(
            &task.feature_id,
            Some(task.task_id),
            format!("task {} deferred: {}", task.sequence_number, reason),
        )
        .await;
        Ok(LaunchOutcome::Deferred {
            reason: reason.to_string(),
        })
    }

    /// Inputs come from completed dependencies and do not change, so a task
    /// whose preconditions fail is parked as `blocked` instead of retried.
    async fn park(&self, task: &Task, execution_id: &str, err: OrchestrationError) -> Result<LaunchOutcome> {
        let task_id = task.task_id;
        self.guard.refund(task_id).await?;
        self.release_resources(execution_id).await;
        self.discard_execution(task, execution_id).await;
        if !self.transition(task_id, TaskStatus::Running, TaskStatus::Blocked).await? {
            warn!(task_id, "Task left running state while parking");
            return Ok(LaunchOutcome::Lost);
        }

        let remaining = self.guard.remaining(task_id).await?;
        let summary = TerminalSummary::from_error(
            &task.feature_id,
            Some(task_id),
            task.kind.as_str(),
            &err,
            Some(remaining),
        );
        warn!(task_id, feature_id = %task.feature_id, "{}", summary);
        self.surface_terminal(task, &summary).await;
        self.notify(Notice::TaskBlocked { summary });
        Ok(LaunchOutcome::Blocked {
            reason: err.to_string(),
        })
    }

    /// Drop an execution that never reached a worker and restore the
    /// task's link to its previous run.
    async fn discard_execution(&self, task: &Task, execution_id: &str) {
        let id = execution_id.to_string();
        let task_id = task.task_id;
        let previous = task.execution_ref.clone();
        if let Err(e) = self
            .db
            .call(move |db| db.discard_execution(&id, task_id, previous.as_deref()))
            .await
        {
            warn!(task_id, execution_id, "Failed to discard unused execution: {:#}", e);
        }
    }

    async fn complete_without_worker(&self, task: &Task, previous: &str) -> Result<LaunchOutcome> {
        if !self.transition(task.task_id, TaskStatus::Running, TaskStatus::Completed).await? {
            return Ok(LaunchOutcome::Lost);
        }
        info!(task_id = task.task_id, execution_id = previous, "Outputs already valid, completing without a worker");
        self.finish_success(task, Some(previous), "already complete").await;
        Ok(LaunchOutcome::AlreadyComplete)
    }

    /// Create the task's work item the first time it launches. Tracker
    /// failures never block the launch.
    async fn ensure_work_item(&self, task: &Task) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        if task.external_ref.is_some() {
            return;
        }
        let (title, body) = crate::integrations::work_item_for(
            &task.feature_id,
            task.sequence_number,
            &task.title,
            &task.payload,
        );
        match tracker.create_work_item(&title, &body, &self.tracker_labels).await {
            Ok(external_ref) => {
                let task_id = task.task_id;
                let stored = external_ref.clone();
                if let Err(e) = self
                    .db
                    .call(move |db| db.set_external_ref(task_id, &stored))
                    .await
                {
                    warn!(task_id, "Failed to store work item reference: {:#}", e);
                }
                debug!(task_id, external_ref, "Created work item");
            }
            Err(e) => warn!(task_id = task.task_id, "Failed to create work item: {:#}", e),
        }
    }

    /// New execution carrying the outputs of the task's completed
    /// dependencies, recorded as the task's current execution.
    async fn open_execution(&self, task: &Task) -> Result<Execution> {
        let execution_id = Uuid::new_v4().to_string();
        let task = task.clone();
        self.db
            .call(move |db| {
                let mut metadata = ExecutionMetadata::default();
                let siblings = db.get_tasks_for_feature(&task.feature_id)?;
                for dep in siblings
                    .iter()
                    .filter(|t| task.depends_on.contains(&t.sequence_number))
                {
                    if let Some(upstream_id) = &dep.execution_ref
                        && let Some(upstream) = db.get_execution(upstream_id)?
                    {
                        metadata.inherit(&upstream.metadata);
                    }
                }
                // a task's own result only ever comes from its own run
                metadata.results.remove(task.kind.as_str());
                let execution = db.create_execution(&execution_id, task.task_id, &metadata)?;
                db.set_execution_ref(task.task_id, &execution_id)?;
                Ok(execution)
            })
            .await
    }

    /// Reserve a port slot and a workspace for `execution_id`. Nothing is
    /// left held when either allocation fails.
    pub async fn reserve_resources(
        &self,
        execution_id: &str,
        branch: &str,
    ) -> Result<(PortPair, PathBuf), OrchestrationError> {
        let ports = self.ports.reserve(execution_id).await?;
        let id = execution_id.to_string();
        if let Err(e) = self
            .db
            .call(move |db| db.set_execution_ports(&id, Some(ports)))
            .await
        {
            self.release_ports(execution_id).await;
            return Err(e.into());
        }

        match self.workspaces.create(execution_id, branch).await {
            Ok(path) => Ok((ports, path)),
            Err(e) => {
                self.release_ports(execution_id).await;
                Err(e)
            }
        }
    }

    /// Free everything held by `execution_id`. Never fails; problems are
    /// logged.
    pub async fn release_resources(&self, execution_id: &str) {
        self.release_ports(execution_id).await;
        self.workspaces.remove(execution_id).await;
        let id = execution_id.to_string();
        if let Err(e) = self.db.call(move |db| db.mark_execution_released(&id)).await {
            warn!(execution_id, "Failed to mark execution released: {:#}", e);
        }
    }

    async fn release_ports(&self, execution_id: &str) {
        if let Err(e) = self.ports.release(execution_id).await {
            warn!(execution_id, "Failed to release port slot: {:#}", e);
        }
    }

    /// Copy workspace artifacts out before the workspace goes away.
    pub(super) async fn keep_artifacts(&self, execution_id: &str) {
        let Some(dest) = &self.artifacts_dir else {
            return;
        };
        if let Err(e) = preserve_artifacts(&self.db, execution_id, dest).await {
            warn!(execution_id, "Failed to preserve artifacts: {:#}", e);
        }
    }
}
