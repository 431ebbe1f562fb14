use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::runner::{RunOutcome, TaskRunner};
use crate::coordinator::CoordinatorEvent;
use crate::store::{Execution, Task};

/// Starts a task's worker without waiting for it. Completion arrives later
/// as a [`CoordinatorEvent::Completion`].
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, task: &Task, execution: &Execution) -> Result<()>;
}

/// Runs the [`TaskRunner`] on a spawned tokio task.
pub struct DetachedLauncher {
    runner: Arc<TaskRunner>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl DetachedLauncher {
    pub fn new(runner: Arc<TaskRunner>, events: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self { runner, events }
    }
}

#[async_trait]
impl WorkerLauncher for DetachedLauncher {
    async fn launch(&self, task: &Task, execution: &Execution) -> Result<()> {
        if self.events.is_closed() {
            bail!("coordinator is no longer accepting completion events");
        }

        let runner = self.runner.clone();
        let events = self.events.clone();
        let task = task.clone();
        let execution_id = execution.execution_id.clone();

        tokio::spawn(async move {
            let outcome = match runner.run(&task, &execution_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(task_id = task.task_id, execution_id, "Task run failed: {:#}", e);
                    RunOutcome::Failed {
                        reason: format!("{:#}", e),
                    }
                }
            };
            info!(task_id = task.task_id, status = %outcome.status(), "Worker finished");
            let event = CoordinatorEvent::Completion {
                task_id: task.task_id,
                status: outcome.status(),
                error: outcome.error(),
                metadata: None,
            };
            if events.send(event).is_err() {
                warn!(task_id = task.task_id, "Coordinator gone; completion event dropped");
            }
        });
        Ok(())
    }
}
