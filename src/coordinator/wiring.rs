use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Coordinator, CoordinatorDeps, CoordinatorEvent};
use crate::config::ConductorConfig;
use crate::contract::ContractValidator;
use crate::guard::{AttemptLedger, CircuitBreaker, LoopGuard, MemoryLedger, SqliteLedger};
use crate::integrations::{AnalyticsSink, GhIssueTracker, IssueTracker, JsonlSink};
use crate::pool::PortPool;
use crate::store::DbHandle;
use crate::worker::{DetachedLauncher, ProcessInvoker, TaskRunner};
use crate::workspace::WorkspaceManager;

impl Coordinator {
    /// Assemble the production coordinator: git worktrees, the worker CLI
    /// launched in the background, `gh` issues when enabled and a JSONL
    /// analytics file. Returns the receiver to pass to [`Coordinator::run`].
    pub async fn from_config(
        config: &ConductorConfig,
        db: DbHandle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CoordinatorEvent>)> {
        let toml = &config.toml;
        let (tx, rx) = mpsc::unbounded_channel();

        let ports = PortPool::new(db.clone(), toml.ports).await?;
        let workspaces = WorkspaceManager::new(
            db.clone(),
            &config.project_dir,
            &config.workspace_root(),
            toml.workspace.clone(),
        )?;
        let validator = ContractValidator::new(db.clone(), &config.project_dir);

        let ledger: Arc<dyn AttemptLedger> = if toml.coordinator.persist_attempts {
            Arc::new(SqliteLedger::new(db.clone()))
        } else {
            Arc::new(MemoryLedger::new())
        };
        let guard = LoopGuard::new(ledger, toml.coordinator.max_attempts, toml.coordinator.cooldown());

        let worker_cmd = config.worker_cmd();
        debug!(worker_cmd, "Using worker command");
        let invoker = Arc::new(ProcessInvoker::new(worker_cmd, toml.worker.args.clone()));
        let runner = Arc::new(TaskRunner::new(
            db.clone(),
            validator.clone(),
            invoker,
            toml.remediation.clone(),
            &config.project_dir,
        ));
        let launcher = Arc::new(DetachedLauncher::new(runner, tx.clone()));

        let tracker: Option<Arc<dyn IssueTracker>> = toml
            .tracker
            .enabled
            .then(|| Arc::new(GhIssueTracker::new(&config.project_dir)) as Arc<dyn IssueTracker>);
        let analytics: Arc<dyn AnalyticsSink> = Arc::new(JsonlSink::new(config.analytics_file()));

        let coordinator = Coordinator::new(CoordinatorDeps {
            db,
            ports,
            workspaces: Arc::new(workspaces),
            validator,
            guard,
            breaker: CircuitBreaker::from_config(&toml.circuit_breaker),
            launcher,
            tracker,
            tracker_labels: toml.tracker.labels.clone(),
            analytics: Some(analytics),
            artifacts_dir: Some(config.artifacts_dir()),
            concurrency_limit: config.concurrency_limit(),
            events: tx,
        });
        Ok((coordinator, rx))
    }
}
