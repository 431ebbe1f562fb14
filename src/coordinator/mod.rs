//! Event-driven coordinator.
//!
//! ## Lifecycle
//!
//! A submitted feature's tasks start `queued`. On every event (a completion,
//! a re-evaluation request or the periodic sweep) the coordinator:
//!
//! 1. applies the completion: `running -> completed`, or back to `ready`
//!    with a retry-marked status message
//! 2. checks the feature's circuit breaker and completion
//! 3. promotes `queued` tasks whose dependencies all completed
//! 4. launches `ready` tasks while fewer than `concurrency_limit` run
//!
//! Launching never waits for the worker; the result comes back later as a
//! [`CoordinatorEvent::Completion`]. Every status change is a conditional
//! update in the store, so duplicate events and concurrent callers are
//! harmless.

pub mod events;
mod launch;
mod wiring;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::contract::ContractValidator;
use crate::errors::{OrchestrationError, TerminalSummary};
use crate::guard::{CircuitBreaker, CircuitTrip, LoopGuard};
use crate::integrations::{AnalyticsSink, IssueTracker, PhaseRecord, seconds_since};
use crate::pool::PortPool;
use crate::store::{DbHandle, ExecutionMetadata, FeatureSpec, FeatureStatus, Task, TaskGraph, TaskStatus};
use crate::worker::WorkerLauncher;
use crate::workspace::WorkspaceProvider;

pub use events::{CoordinatorEvent, Notice};
pub use launch::LaunchOutcome;

const NOTICE_CAPACITY: usize = 256;

/// Collaborators and limits a [`Coordinator`] is built from.
pub struct CoordinatorDeps {
    pub db: DbHandle,
    pub ports: PortPool,
    pub workspaces: Arc<dyn WorkspaceProvider>,
    pub validator: ContractValidator,
    pub guard: LoopGuard,
    pub breaker: CircuitBreaker,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub tracker: Option<Arc<dyn IssueTracker>>,
    pub tracker_labels: Vec<String>,
    pub analytics: Option<Arc<dyn AnalyticsSink>>,
    /// Where workspace artifacts are copied before a workspace is removed.
    pub artifacts_dir: Option<PathBuf>,
    pub concurrency_limit: usize,
    /// Sender side of the channel the run loop consumes.
    pub events: mpsc::UnboundedSender<CoordinatorEvent>,
}

/// Options for [`Coordinator::run`].
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub sweep_interval: Duration,
    /// Return once nothing is running and nothing is ready.
    pub until_idle: bool,
}

pub struct Coordinator {
    db: DbHandle,
    ports: PortPool,
    workspaces: Arc<dyn WorkspaceProvider>,
    validator: ContractValidator,
    guard: LoopGuard,
    breaker: CircuitBreaker,
    launcher: Arc<dyn WorkerLauncher>,
    tracker: Option<Arc<dyn IssueTracker>>,
    tracker_labels: Vec<String>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    artifacts_dir: Option<PathBuf>,
    concurrency_limit: usize,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    notices: broadcast::Sender<Notice>,
    /// Serializes evaluation so the running count read before launching
    /// stays accurate.
    dispatch: Mutex<()>,
}

/// Cheap handle for reporting events to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub fn report_completion(
        &self,
        task_id: i64,
        status: TaskStatus,
        error: Option<String>,
        metadata: Option<ExecutionMetadata>,
    ) -> Result<()> {
        self.send(CoordinatorEvent::Completion {
            task_id,
            status,
            error,
            metadata,
        })
    }

    pub fn reevaluate(&self, feature_id: Option<String>) -> Result<()> {
        self.send(CoordinatorEvent::Reevaluate { feature_id })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(CoordinatorEvent::Shutdown)
    }

    fn send(&self, event: CoordinatorEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow::anyhow!("coordinator is not running"))
    }
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            db: deps.db,
            ports: deps.ports,
            workspaces: deps.workspaces,
            validator: deps.validator,
            guard: deps.guard,
            breaker: deps.breaker,
            launcher: deps.launcher,
            tracker: deps.tracker,
            tracker_labels: deps.tracker_labels,
            analytics: deps.analytics,
            artifacts_dir: deps.artifacts_dir,
            concurrency_limit: deps.concurrency_limit,
            events: deps.events,
            notices,
            dispatch: Mutex::new(()),
        }
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Store a feature's task graph and launch whatever is ready.
    pub async fn submit_feature(&self, spec: FeatureSpec) -> Result<Vec<Task>> {
        let feature_id = spec.feature_id.clone();
        let tasks = self.db.call(move |db| db.submit_feature(&spec)).await?;
        info!(feature_id, tasks = tasks.len(), "Feature submitted");
        self.reevaluate(Some(&feature_id)).await;
        Ok(tasks)
    }

    /// `ready` tasks across all features, highest priority first.
    pub async fn get_ready_tasks(&self) -> Result<Vec<Task>> {
        self.db.call(|db| db.ready_tasks(None)).await
    }

    /// Apply a worker's completion, then re-evaluate the task's feature.
    ///
    /// Events for tasks that are no longer `running` are duplicates and
    /// change nothing besides triggering another evaluation.
    pub async fn handle_completion_event(
        &self,
        task_id: i64,
        status: TaskStatus,
        error: Option<String>,
        metadata: Option<ExecutionMetadata>,
    ) -> Result<()> {
        let _dispatch = self.dispatch.lock().await;
        let task = self
            .db
            .call(move |db| db.get_task(task_id))
            .await?
            .ok_or(OrchestrationError::TaskNotFound { task_id })?;

        if let (Some(metadata), Some(execution_id)) = (metadata, task.execution_ref.clone()) {
            self.merge_metadata(execution_id, metadata).await;
        }

        match status {
            TaskStatus::Completed => self.complete_task(&task).await?,
            TaskStatus::Failed => {
                let reason = error.unwrap_or_else(|| "worker reported failure".to_string());
                self.fail_attempt(&task, &reason).await?;
            }
            other => warn!(task_id, status = %other, "Ignoring completion event with non-terminal status"),
        }

        self.evaluate(Some(&task.feature_id)).await;
        Ok(())
    }

    /// Re-run readiness and dispatch for one feature, or every feature in
    /// progress.
    pub async fn reevaluate(&self, feature_id: Option<&str>) {
        let _dispatch = self.dispatch.lock().await;
        self.evaluate(feature_id).await;
    }

    /// Consume events until shutdown, sweeping every `sweep_interval`.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<CoordinatorEvent>, options: RunOptions) -> Result<()> {
        let recovered = self.recover_interrupted().await?;
        if recovered > 0 {
            warn!(recovered, "Requeued tasks left running by a previous coordinator");
        }
        self.reevaluate(None).await;

        let mut sweep = tokio::time::interval(options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        info!(concurrency_limit = self.concurrency_limit, "Coordinator running");
        loop {
            if options.until_idle && self.is_idle().await? {
                info!("Nothing running or ready, stopping");
                break;
            }
            tokio::select! {
                event = events.recv() => match event {
                    None | Some(CoordinatorEvent::Shutdown) => {
                        info!("Coordinator shutting down");
                        break;
                    }
                    Some(event) => self.handle_event(event).await,
                },
                _ = sweep.tick() => {
                    debug!("Periodic sweep");
                    self.reevaluate(None).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Completion {
                task_id,
                status,
                error,
                metadata,
            } => {
                if let Err(e) = self
                    .handle_completion_event(task_id, status, error, metadata)
                    .await
                {
                    error!(task_id, "Failed to handle completion: {:#}", e);
                }
            }
            CoordinatorEvent::Reevaluate { feature_id } => self.reevaluate(feature_id.as_deref()).await,
            CoordinatorEvent::Shutdown => {}
        }
    }

    /// Return tasks left `running` by a previous process to `ready`.
    ///
    /// Call only before anything is launched from this process: no worker
    /// survives a coordinator restart. The attempt stays counted, and a run
    /// that had already produced valid outputs completes on relaunch.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let running = self.db.call(|db| db.tasks_with_status(TaskStatus::Running)).await?;
        let mut recovered = 0;
        for task in running {
            if !self
                .transition(task.task_id, TaskStatus::Running, TaskStatus::Ready)
                .await?
            {
                continue;
            }
            if let Some(execution_id) = &task.execution_ref {
                self.keep_artifacts(execution_id).await;
                self.release_resources(execution_id).await;
            }
            self.post(
                &task.feature_id,
                Some(task.task_id),
                format!("task {} interrupted by a restart, requeued", task.sequence_number),
            )
            .await;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn is_idle(&self) -> Result<bool> {
        self.db
            .call(|db| {
                if db.count_running()? > 0 {
                    return Ok(false);
                }
                let active: HashSet<String> = db.in_progress_features()?.into_iter().collect();
                Ok(!db
                    .ready_tasks(None)?
                    .iter()
                    .any(|t| active.contains(&t.feature_id)))
            })
            .await
    }

    async fn complete_task(&self, task: &Task) -> Result<()> {
        if !self
            .transition(task.task_id, TaskStatus::Running, TaskStatus::Completed)
            .await?
        {
            debug!(task_id = task.task_id, status = %task.status, "Duplicate completion ignored");
            return Ok(());
        }
        self.record_phase(task, true, None).await;
        self.finish_success(task, task.execution_ref.as_deref(), "completed").await;
        Ok(())
    }

    /// Bookkeeping shared by worker and no-worker completions.
    async fn finish_success(&self, task: &Task, execution_id: Option<&str>, how: &str) {
        if let Err(e) = self.guard.record_success(task.task_id).await {
            warn!(task_id = task.task_id, "Failed to clear loop guard: {:#}", e);
        }
        if let Some(execution_id) = execution_id {
            self.keep_artifacts(execution_id).await;
            self.release_resources(execution_id).await;
        }
        if let (Some(tracker), Some(external_ref)) = (&self.tracker, &task.external_ref)
            && let Err(e) = tracker
                .close(external_ref, &format!("Task {} {}.", task.sequence_number, how))
                .await
        {
            warn!(task_id = task.task_id, "Failed to close work item: {:#}", e);
        }
        self.post(
            &task.feature_id,
            Some(task.task_id),
            format!("task {} '{}' {}", task.sequence_number, task.title, how),
        )
        .await;
        self.notify(Notice::TaskCompleted {
            task_id: task.task_id,
            feature_id: task.feature_id.clone(),
        });
        info!(task_id = task.task_id, feature_id = %task.feature_id, "Task {}", how);
    }

    /// A failed run returns the task to `ready`; the Loop Guard decides at
    /// the next launch whether it may run again.
    async fn fail_attempt(&self, task: &Task, reason: &str) -> Result<()> {
        if !self
            .transition(task.task_id, TaskStatus::Running, TaskStatus::Ready)
            .await?
        {
            debug!(task_id = task.task_id, status = %task.status, "Duplicate failure ignored");
            return Ok(());
        }
        self.guard.record_failure(task.task_id).await?;
        let remaining = self.guard.remaining(task.task_id).await?;
        let attempt = self.guard.max_attempts().saturating_sub(remaining);

        self.record_phase(task, false, Some(reason)).await;
        if let Some(execution_id) = &task.execution_ref {
            self.reject_own_result(task, execution_id).await;
            self.keep_artifacts(execution_id).await;
            self.release_resources(execution_id).await;
        }
        self.post(
            &task.feature_id,
            Some(task.task_id),
            self.breaker.retry_message(&format!(
                "task {} failed on attempt {}/{}: {}",
                task.sequence_number,
                attempt,
                self.guard.max_attempts(),
                reason
            )),
        )
        .await;
        self.notify(Notice::TaskRetrying {
            task_id: task.task_id,
            feature_id: task.feature_id.clone(),
            error: reason.to_string(),
            remaining_attempts: remaining,
        });
        warn!(task_id = task.task_id, remaining, "Task failed: {}", reason);
        Ok(())
    }

    /// Surface a terminal task failure and block everything downstream.
    async fn fail_permanently(&self, task: &Task, err: &OrchestrationError) {
        let summary = TerminalSummary::from_error(
            &task.feature_id,
            Some(task.task_id),
            task.kind.as_str(),
            err,
            Some(0),
        );
        error!(task_id = task.task_id, feature_id = %task.feature_id, "{}", summary);
        self.surface_terminal(task, &summary).await;
        self.notify(Notice::TaskFailed { summary });
    }

    /// Block everything downstream of a task that will not complete, and
    /// report why on its work item and in the status log.
    async fn surface_terminal(&self, task: &Task, summary: &TerminalSummary) {
        match self.block_dependents(task).await {
            Ok(blocked) if !blocked.is_empty() => {
                info!(task_id = task.task_id, ?blocked, "Blocked dependent tasks");
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = task.task_id, "Failed to block dependents: {:#}", e),
        }
        if let (Some(tracker), Some(external_ref)) = (&self.tracker, &task.external_ref)
            && let Err(e) = tracker.comment(external_ref, &summary.to_string()).await
        {
            warn!(task_id = task.task_id, "Failed to comment on work item: {:#}", e);
        }
        self.post(&task.feature_id, Some(task.task_id), summary.to_string()).await;
    }

    /// Move every `queued` transitive dependent of `task` to `blocked`.
    async fn block_dependents(&self, task: &Task) -> Result<Vec<i64>> {
        let feature_id = task.feature_id.clone();
        let seq = task.sequence_number;
        self.db
            .call(move |db| {
                let tasks = db.get_tasks_for_feature(&feature_id)?;
                let graph = TaskGraph::from_edges(
                    tasks.iter().map(|t| (t.sequence_number, t.depends_on.clone())),
                );
                let downstream: HashSet<i64> = graph.transitive_dependents(seq).into_iter().collect();
                let mut blocked = Vec::new();
                for t in tasks.iter().filter(|t| downstream.contains(&t.sequence_number)) {
                    if db.transition(t.task_id, TaskStatus::Queued, TaskStatus::Blocked)? {
                        blocked.push(t.task_id);
                    }
                }
                Ok(blocked)
            })
            .await
    }

    /// Evaluate features until no task completes without a worker.
    async fn evaluate(&self, feature_id: Option<&str>) {
        let mut focus = match feature_id {
            Some(id) => vec![id.to_string()],
            None => match self.db.call(|db| db.in_progress_features()).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!("Failed to list features: {:#}", e);
                    return;
                }
            },
        };

        loop {
            for id in &focus {
                if let Err(e) = self.settle_feature(id).await {
                    error!(feature_id = %id, "Failed to evaluate feature: {:#}", e);
                }
            }
            match self.dispatch(feature_id).await {
                Ok(finished) if !finished.is_empty() => focus = finished,
                Ok(_) => break,
                Err(e) => {
                    error!("Dispatch failed: {:#}", e);
                    break;
                }
            }
        }
    }

    /// Circuit breaker, completion, then readiness for one feature.
    async fn settle_feature(&self, feature_id: &str) -> Result<()> {
        let id = feature_id.to_string();
        let Some(feature) = self.db.call(move |db| db.get_feature(&id)).await? else {
            return Ok(());
        };
        if feature.status != FeatureStatus::InProgress {
            return Ok(());
        }

        if let Some(trip) = self.breaker.check(&self.db, feature_id).await? {
            return self.abort_feature(feature_id, trip).await;
        }

        let id = feature_id.to_string();
        let progress = self.db.call(move |db| db.feature_progress(&id)).await?;
        if progress.all_completed() {
            let id = feature_id.to_string();
            let changed = self
                .db
                .call(move |db| db.set_feature_status(&id, &FeatureStatus::Completed))
                .await?;
            if changed {
                info!(feature_id, tasks = progress.total, "Feature completed");
                self.notify(Notice::FeatureCompleted {
                    feature_id: feature_id.to_string(),
                });
            }
            return Ok(());
        }

        let id = feature_id.to_string();
        let promoted = self.db.call(move |db| db.find_ready(&id)).await?;
        if !promoted.is_empty() {
            debug!(
                feature_id,
                promoted = ?promoted.iter().map(|t| t.sequence_number).collect::<Vec<_>>(),
                "Tasks became ready"
            );
        }
        Ok(())
    }

    async fn abort_feature(&self, feature_id: &str, trip: CircuitTrip) -> Result<()> {
        let id = feature_id.to_string();
        let (changed, blocked) = self
            .db
            .call(move |db| {
                if !db.set_feature_status(&id, &FeatureStatus::Aborted)? {
                    return Ok((false, 0));
                }
                let mut blocked = 0;
                for task in db.get_tasks_for_feature(&id)? {
                    if matches!(task.status, TaskStatus::Queued | TaskStatus::Ready)
                        && db.transition(task.task_id, task.status, TaskStatus::Blocked)?
                    {
                        blocked += 1;
                    }
                }
                Ok((true, blocked))
            })
            .await?;
        if !changed {
            return Ok(());
        }

        let err = OrchestrationError::CircuitTripped {
            feature_id: feature_id.to_string(),
            hits: trip.hits,
            window: trip.window,
        };
        let summary = TerminalSummary::from_error(feature_id, None, "coordination", &err, None);
        error!(feature_id, blocked, "{}", summary);
        self.post(feature_id, None, summary.to_string()).await;
        self.notify(Notice::FeatureAborted { summary });
        Ok(())
    }

    /// Launch `ready` tasks into free concurrency slots, `preferred`
    /// feature first. Returns the features in which a task completed
    /// without a worker, since their dependents may now be ready.
    async fn dispatch(&self, preferred: Option<&str>) -> Result<Vec<String>> {
        let running = self.db.call(|db| db.count_running()).await?;
        let mut free = self
            .concurrency_limit
            .saturating_sub(usize::try_from(running).unwrap_or(usize::MAX));
        if free == 0 {
            debug!(running, limit = self.concurrency_limit, "No free concurrency slots");
            return Ok(Vec::new());
        }

        let mut candidates = self
            .db
            .call(|db| {
                let active: HashSet<String> = db.in_progress_features()?.into_iter().collect();
                Ok(db
                    .ready_tasks(None)?
                    .into_iter()
                    .filter(|t| active.contains(&t.feature_id))
                    .collect::<Vec<_>>())
            })
            .await?;
        if let Some(preferred) = preferred {
            candidates.sort_by_key(|t| t.feature_id != preferred);
        }

        let mut finished: Vec<String> = Vec::new();
        for task in &candidates {
            if free == 0 {
                break;
            }
            match self.launch(task).await {
                Ok(LaunchOutcome::Launched { .. }) => free -= 1,
                Ok(LaunchOutcome::AlreadyComplete) => {
                    if !finished.contains(&task.feature_id) {
                        finished.push(task.feature_id.clone());
                    }
                }
                Ok(_) => {}
                Err(e) => error!(task_id = task.task_id, "Launch failed: {:#}", e),
            }
        }
        Ok(finished)
    }

    async fn merge_metadata(&self, execution_id: String, metadata: ExecutionMetadata) {
        if let Err(e) = metadata.check_single_writer() {
            warn!(execution_id, "Rejected completion metadata: {:#}", e);
            return;
        }
        let id = execution_id.clone();
        let result = self
            .db
            .call(move |db| {
                let Some(execution) = db.get_execution(&id)? else {
                    return Ok(());
                };
                let mut merged = execution.metadata;
                merged.merge(metadata);
                db.update_execution_metadata(&id, &merged)
            })
            .await;
        if let Err(e) = result {
            warn!(execution_id, "Failed to merge completion metadata: {:#}", e);
        }
    }

    /// A failed run's result must not let the next launch skip the worker.
    async fn reject_own_result(&self, task: &Task, execution_id: &str) {
        let id = execution_id.to_string();
        let kind = task.kind;
        let result = self
            .db
            .call(move |db| {
                let Some(execution) = db.get_execution(&id)? else {
                    return Ok(false);
                };
                let mut metadata = execution.metadata;
                if !metadata.reject_result(kind) {
                    return Ok(false);
                }
                db.update_execution_metadata(&id, &metadata)?;
                Ok(true)
            })
            .await;
        match result {
            Ok(true) => debug!(task_id = task.task_id, execution_id, "Rejected result of failed run"),
            Ok(false) => {}
            Err(e) => warn!(task_id = task.task_id, execution_id, "Failed to reject result of failed run: {:#}", e),
        }
    }

    async fn record_phase(&self, task: &Task, success: bool, error: Option<&str>) {
        let Some(sink) = &self.analytics else {
            return;
        };
        let now = Utc::now();
        let record = PhaseRecord {
            task_id: task.task_id,
            feature_id: task.feature_id.clone(),
            phase_kind: task.kind,
            success,
            duration_secs: task.started_at.as_deref().and_then(|s| seconds_since(s, now)),
            error: error.map(String::from),
            recorded_at: now,
        };
        if let Err(e) = sink.record(&record).await {
            warn!(task_id = task.task_id, "Failed to record analytics: {:#}", e);
        }
    }

    async fn transition(&self, task_id: i64, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        self.db.call(move |db| db.transition(task_id, from, to)).await
    }

    /// Append a status message; the circuit breaker reads these back.
    async fn post(&self, feature_id: &str, task_id: Option<i64>, body: String) {
        let id = feature_id.to_string();
        if let Err(e) = self
            .db
            .call(move |db| db.append_status_message(&id, task_id, &body))
            .await
        {
            warn!(feature_id, "Failed to append status message: {:#}", e);
        }
    }

    fn notify(&self, notice: Notice) {
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortsSection;
    use crate::guard::MemoryLedger;
    use crate::store::{Execution, TaskKind, TaskSpec};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: StdMutex<Vec<(i64, String)>>,
        fail: AtomicBool,
    }

    impl RecordingLauncher {
        fn launched_tasks(&self) -> Vec<i64> {
            self.launched.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    #[async_trait]
    impl WorkerLauncher for RecordingLauncher {
        async fn launch(&self, task: &Task, execution: &Execution) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("no worker available");
            }
            self.launched
                .lock()
                .unwrap()
                .push((task.task_id, execution.execution_id.clone()));
            Ok(())
        }
    }

    /// Plain directories instead of git worktrees.
    struct DirWorkspaces {
        db: DbHandle,
        root: PathBuf,
    }

    #[async_trait]
    impl WorkspaceProvider for DirWorkspaces {
        async fn create(&self, execution_id: &str, branch: &str) -> Result<PathBuf, OrchestrationError> {
            let path = self.root.join(execution_id);
            std::fs::create_dir_all(&path).map_err(anyhow::Error::from)?;
            let id = execution_id.to_string();
            let path_str = path.to_string_lossy().to_string();
            let branch = branch.to_string();
            self.db
                .call(move |db| db.set_execution_workspace(&id, Some(&path_str), Some(&branch)))
                .await?;
            Ok(path)
        }

        async fn remove(&self, execution_id: &str) {
            let _ = std::fs::remove_dir_all(self.root.join(execution_id));
            let id = execution_id.to_string();
            let _ = self
                .db
                .call(move |db| db.set_execution_workspace(&id, None, None))
                .await;
        }
    }

    struct Harness {
        _dir: TempDir,
        db: DbHandle,
        launcher: Arc<RecordingLauncher>,
        coordinator: Coordinator,
    }

    async fn harness(limit: usize, capacity: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let db = DbHandle::in_memory().unwrap();
        let ports = PortPool::new(
            db.clone(),
            PortsSection {
                capacity,
                ..PortsSection::default()
            },
        )
        .await
        .unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(CoordinatorDeps {
            db: db.clone(),
            ports,
            workspaces: Arc::new(DirWorkspaces {
                db: db.clone(),
                root: dir.path().join("ws"),
            }),
            validator: ContractValidator::new(db.clone(), dir.path()),
            guard: LoopGuard::new(Arc::new(MemoryLedger::new()), 3, Duration::ZERO),
            breaker: CircuitBreaker::new(20, 12, "[retry]"),
            launcher: launcher.clone(),
            tracker: None,
            tracker_labels: Vec::new(),
            analytics: None,
            artifacts_dir: None,
            concurrency_limit: limit,
            events: tx,
        });
        Harness {
            _dir: dir,
            db,
            launcher,
            coordinator,
        }
    }

    fn fan_out() -> FeatureSpec {
        FeatureSpec {
            feature_id: "feat".into(),
            title: "Fan out".into(),
            tasks: vec![
                TaskSpec::new(1, "Root", vec![]),
                TaskSpec::new(2, "Left", vec![1]),
                TaskSpec::new(3, "Right", vec![1]),
            ],
        }
    }

    fn status(db: &DbHandle, task_id: i64) -> TaskStatus {
        db.lock_sync().unwrap().get_task(task_id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_submit_launches_roots_only() {
        let h = harness(4, 10).await;
        let tasks = h.coordinator.submit_feature(fan_out()).await.unwrap();

        assert_eq!(h.launcher.launched_tasks(), vec![tasks[0].task_id]);
        assert_eq!(status(&h.db, tasks[0].task_id), TaskStatus::Running);
        assert_eq!(status(&h.db, tasks[1].task_id), TaskStatus::Queued);
        assert_eq!(status(&h.db, tasks[2].task_id), TaskStatus::Queued);

        let exec_id = h.launcher.launched.lock().unwrap()[0].1.clone();
        let exec = h.db.lock_sync().unwrap().get_execution(&exec_id).unwrap().unwrap();
        assert!(exec.workspace_path.is_some());
        assert_eq!(exec.ports.unwrap().backend, 8000);
        assert_eq!(exec.branch_name.as_deref(), Some("conductor/feat-1-root"));
    }

    #[tokio::test]
    async fn test_completion_promotes_dependents_within_limit() {
        let h = harness(1, 10).await;
        let mut notices = h.coordinator.subscribe();
        let tasks = h.coordinator.submit_feature(fan_out()).await.unwrap();
        let ids: Vec<i64> = tasks.iter().map(|t| t.task_id).collect();

        h.coordinator
            .handle_completion_event(ids[0], TaskStatus::Completed, None, None)
            .await
            .unwrap();
        assert_eq!(status(&h.db, ids[0]), TaskStatus::Completed);
        assert_eq!(status(&h.db, ids[1]), TaskStatus::Running);
        assert_eq!(status(&h.db, ids[2]), TaskStatus::Ready);

        h.coordinator
            .handle_completion_event(ids[1], TaskStatus::Completed, None, None)
            .await
            .unwrap();
        assert_eq!(status(&h.db, ids[2]), TaskStatus::Running);
        h.coordinator
            .handle_completion_event(ids[2], TaskStatus::Completed, None, None)
            .await
            .unwrap();

        let feature = h.db.lock_sync().unwrap().get_feature("feat").unwrap().unwrap();
        assert_eq!(feature.status, FeatureStatus::Completed);
        assert_eq!(h.launcher.launched_tasks(), ids);

        let mut saw_feature_completed = false;
        while let Ok(notice) = notices.try_recv() {
            if notice == (Notice::FeatureCompleted { feature_id: "feat".into() }) {
                saw_feature_completed = true;
            }
        }
        assert!(saw_feature_completed);
    }

    #[tokio::test]
    async fn test_duplicate_completion_changes_nothing() {
        let h = harness(1, 10).await;
        let tasks = h.coordinator.submit_feature(fan_out()).await.unwrap();
        let root = tasks[0].task_id;

        for _ in 0..2 {
            h.coordinator
                .handle_completion_event(root, TaskStatus::Completed, None, None)
                .await
                .unwrap();
        }
        assert_eq!(h.launcher.launched_tasks().len(), 2);
        assert_eq!(h.db.lock_sync().unwrap().count_running().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_is_reported() {
        let h = harness(1, 10).await;
        let err = h
            .coordinator
            .handle_completion_event(999, TaskStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Task 999 not found"));
    }

    #[tokio::test]
    async fn test_failure_requeues_with_retry_marker() {
        let h = harness(1, 10).await;
        let mut notices = h.coordinator.subscribe();
        let tasks = h.coordinator.submit_feature(fan_out()).await.unwrap();
        let root = tasks[0].task_id;

        h.coordinator
            .handle_completion_event(root, TaskStatus::Failed, Some("tests failed".into()), None)
            .await
            .unwrap();

        // zero cooldown: relaunched straight away as attempt 2
        assert_eq!(status(&h.db, root), TaskStatus::Running);
        assert_eq!(h.launcher.launched_tasks(), vec![root, root]);

        let messages = h.db.lock_sync().unwrap().recent_status_messages("feat", 10).unwrap();
        assert!(messages.iter().any(|m| m.starts_with("[retry] task 1 failed on attempt 1/3: tests failed")));
        assert!(messages[0].contains("attempt 2/3"));

        let mut remaining = None;
        while let Ok(notice) = notices.try_recv() {
            if let Notice::TaskRetrying { remaining_attempts, .. } = notice {
                remaining = Some(remaining_attempts);
            }
        }
        assert_eq!(remaining, Some(2));
    }

    #[tokio::test]
    async fn test_launch_error_returns_task_to_queue() {
        let h = harness(2, 10).await;
        h.launcher.fail.store(true, Ordering::SeqCst);
        let tasks = h.coordinator.submit_feature(fan_out()).await.unwrap();
        let root = tasks[0].task_id;

        assert_eq!(status(&h.db, root), TaskStatus::Queued);
        assert_eq!(h.coordinator.guard.remaining(root).await.unwrap(), 3);
        let slots = h.coordinator.ports.slots().await.unwrap();
        assert!(slots.iter().all(|s| s.reserved_by.is_none()));
        assert!(h.db.lock_sync().unwrap().executions_for_task(root).unwrap().is_empty());

        h.launcher.fail.store(false, Ordering::SeqCst);
        h.coordinator.reevaluate(Some("feat")).await;
        assert_eq!(status(&h.db, root), TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_execution_inherits_dependency_outputs_but_not_own_result() {
        let h = harness(1, 10).await;
        let tasks = h
            .coordinator
            .submit_feature(FeatureSpec {
                feature_id: "chain".into(),
                title: String::new(),
                tasks: vec![
                    TaskSpec::new(1, "first", vec![]),
                    TaskSpec::new(2, "second", vec![1]),
                ],
            })
            .await
            .unwrap();
        let first = tasks[0].task_id;
        let first_exec = h.launcher.launched.lock().unwrap()[0].1.clone();

        let mut produced = ExecutionMetadata::default();
        produced.set_artifact("notes", "/tmp/notes.md");
        produced.set_result(TaskKind::Generic, serde_json::json!({"done": true}));
        h.coordinator
            .handle_completion_event(first, TaskStatus::Completed, None, Some(produced))
            .await
            .unwrap();

        let stored = h.db.lock_sync().unwrap().get_execution(&first_exec).unwrap().unwrap();
        assert!(stored.metadata.result(TaskKind::Generic).is_some());

        let second_exec = h.launcher.launched.lock().unwrap()[1].1.clone();
        let exec = h.db.lock_sync().unwrap().get_execution(&second_exec).unwrap().unwrap();
        assert_eq!(exec.metadata.artifact("notes"), Some("/tmp/notes.md"));
        assert!(exec.metadata.result(TaskKind::Generic).is_none());
    }

    #[tokio::test]
    async fn test_recover_interrupted_requeues_running_tasks() {
        let h = harness(1, 10).await;
        let tasks = h.coordinator.submit_feature(fan_out()).await.unwrap();
        let root = tasks[0].task_id;
        assert_eq!(status(&h.db, root), TaskStatus::Running);

        assert_eq!(h.coordinator.recover_interrupted().await.unwrap(), 1);
        assert_eq!(status(&h.db, root), TaskStatus::Ready);
        let slots = h.coordinator.ports.slots().await.unwrap();
        assert!(slots.iter().all(|s| s.reserved_by.is_none()));
        assert_eq!(h.coordinator.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reserve_and_release_resources() {
        let h = harness(1, 1).await;
        {
            let store = h.db.lock_sync().unwrap();
            let tasks = store.submit_feature(&fan_out()).unwrap();
            store
                .create_execution("e1", tasks[0].task_id, &ExecutionMetadata::default())
                .unwrap();
            store
                .create_execution("e2", tasks[1].task_id, &ExecutionMetadata::default())
                .unwrap();
        }

        let (ports, path) = h.coordinator.reserve_resources("e1", "b1").await.unwrap();
        assert_eq!(ports.frontend, 9000);
        assert!(path.is_dir());

        let err = h.coordinator.reserve_resources("e2", "b2").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ResourceExhausted { .. }));

        h.coordinator.release_resources("e1").await;
        assert!(!path.exists());
        let exec = h.db.lock_sync().unwrap().get_execution("e1").unwrap().unwrap();
        assert!(exec.released_at.is_some());
        assert!(h.coordinator.reserve_resources("e2", "b2").await.is_ok());
    }
}
