//! Coordinator scenarios driven through the public API with an in-memory
//! store, plain-directory workspaces and a launcher that only records.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use conductor::config::PortsSection;
use conductor::contract::ContractValidator;
use conductor::coordinator::{Coordinator, CoordinatorDeps, LaunchOutcome, Notice};
use conductor::errors::{ErrorCategory, OrchestrationError};
use conductor::guard::{CircuitBreaker, LoopGuard, MemoryLedger};
use conductor::pool::PortPool;
use conductor::store::{
    DbHandle, Execution, ExecutionMetadata, FeatureSpec, FeatureStatus, Task, TaskKind, TaskSpec,
    TaskStatus,
};
use conductor::worker::WorkerLauncher;
use conductor::workspace::WorkspaceProvider;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<(i64, String)>>,
}

impl RecordingLauncher {
    fn tasks(&self) -> Vec<i64> {
        self.launched.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    fn execution_of(&self, task_id: i64) -> String {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| *t == task_id)
            .map(|(_, e)| e.clone())
            .unwrap()
    }
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(&self, task: &Task, execution: &Execution) -> Result<()> {
        self.launched
            .lock()
            .unwrap()
            .push((task.task_id, execution.execution_id.clone()));
        Ok(())
    }
}

struct DirWorkspaces {
    db: DbHandle,
    root: PathBuf,
    live: AtomicUsize,
    fail: AtomicBool,
}

#[async_trait]
impl WorkspaceProvider for DirWorkspaces {
    async fn create(&self, execution_id: &str, branch: &str) -> Result<PathBuf, OrchestrationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(OrchestrationError::AllocationFailure {
                execution_id: execution_id.to_string(),
                source: anyhow::anyhow!("worktree add failed"),
            });
        }
        let path = self.root.join(execution_id);
        std::fs::create_dir_all(&path).map_err(anyhow::Error::from)?;
        let id = execution_id.to_string();
        let path_str = path.to_string_lossy().to_string();
        let branch = branch.to_string();
        self.db
            .call(move |db| db.set_execution_workspace(&id, Some(&path_str), Some(&branch)))
            .await?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }

    async fn remove(&self, execution_id: &str) {
        let path = self.root.join(execution_id);
        if path.exists() {
            let _ = std::fs::remove_dir_all(&path);
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        let id = execution_id.to_string();
        let _ = self
            .db
            .call(move |db| db.set_execution_workspace(&id, None, None))
            .await;
    }
}

struct Scenario {
    _dir: TempDir,
    db: DbHandle,
    launcher: Arc<RecordingLauncher>,
    workspaces: Arc<DirWorkspaces>,
    coordinator: Coordinator,
    notices: broadcast::Receiver<Notice>,
}

async fn scenario(limit: usize, capacity: u32) -> Scenario {
    scenario_with_cooldown(limit, capacity, Duration::ZERO).await
}

async fn scenario_with_cooldown(limit: usize, capacity: u32, cooldown: Duration) -> Scenario {
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
    let workspaces = Arc::new(DirWorkspaces {
        db: db.clone(),
        root: dir.path().join("workspaces"),
        live: AtomicUsize::new(0),
        fail: AtomicBool::new(false),
    });
    let (tx, _rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(CoordinatorDeps {
        db: db.clone(),
        ports,
        workspaces: workspaces.clone(),
        validator: ContractValidator::new(db.clone(), dir.path()),
        guard: LoopGuard::new(Arc::new(MemoryLedger::new()), 3, cooldown),
        breaker: CircuitBreaker::new(20, 12, "[retry]"),
        launcher: launcher.clone(),
        tracker: None,
        tracker_labels: Vec::new(),
        analytics: None,
        artifacts_dir: None,
        concurrency_limit: limit,
        events: tx,
    });
    let notices = coordinator.subscribe();
    Scenario {
        _dir: dir,
        db,
        launcher,
        workspaces,
        coordinator,
        notices,
    }
}

impl Scenario {
    fn status(&self, task_id: i64) -> TaskStatus {
        self.db.lock_sync().unwrap().get_task(task_id).unwrap().unwrap().status
    }

    fn running(&self) -> i64 {
        self.db.lock_sync().unwrap().count_running().unwrap()
    }

    fn feature_status(&self, feature_id: &str) -> FeatureStatus {
        self.db
            .lock_sync()
            .unwrap()
            .get_feature(feature_id)
            .unwrap()
            .unwrap()
            .status
    }

    fn executions(&self, task_id: i64) -> usize {
        self.db.lock_sync().unwrap().executions_for_task(task_id).unwrap().len()
    }

    fn reserved_slots(&self) -> usize {
        self.db
            .lock_sync()
            .unwrap()
            .list_port_slots()
            .unwrap()
            .into_iter()
            .filter(|slot| slot.reserved_by.is_some())
            .count()
    }

    fn drain_notices(&mut self) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            out.push(notice);
        }
        out
    }

    async fn complete(&self, task_id: i64) {
        self.coordinator
            .handle_completion_event(task_id, TaskStatus::Completed, None, None)
            .await
            .unwrap();
    }

    async fn fail(&self, task_id: i64, reason: &str) {
        self.coordinator
            .handle_completion_event(task_id, TaskStatus::Failed, Some(reason.to_string()), None)
            .await
            .unwrap();
    }
}

fn spec(feature_id: &str, tasks: Vec<TaskSpec>) -> FeatureSpec {
    FeatureSpec {
        feature_id: feature_id.into(),
        title: String::new(),
        tasks,
    }
}

fn ids(tasks: &[Task]) -> Vec<i64> {
    tasks.iter().map(|t| t.task_id).collect()
}

#[tokio::test]
async fn test_diamond_with_single_slot_respects_order_and_priority() {
    let s = scenario(1, 10).await;
    let mut urgent = TaskSpec::new(3, "Urgent branch", vec![1]);
    urgent.priority = 5;
    let tasks = s
        .coordinator
        .submit_feature(spec(
            "diamond",
            vec![
                TaskSpec::new(1, "Base", vec![]),
                TaskSpec::new(2, "Slow branch", vec![1]),
                urgent,
                TaskSpec::new(4, "Join", vec![2, 3]),
            ],
        ))
        .await
        .unwrap();
    let t = ids(&tasks);

    for expected in [t[0], t[2], t[1], t[3]] {
        assert_eq!(s.running(), 1);
        assert_eq!(s.status(expected), TaskStatus::Running);
        s.complete(expected).await;
    }

    assert_eq!(s.launcher.tasks(), vec![t[0], t[2], t[1], t[3]]);
    assert_eq!(s.running(), 0);
    assert_eq!(s.feature_status("diamond"), FeatureStatus::Completed);
    assert_eq!(s.workspaces.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exhausted_port_pool_defers_until_a_slot_frees() {
    let s = scenario(4, 2).await;
    let tasks = s
        .coordinator
        .submit_feature(spec(
            "wide",
            vec![
                TaskSpec::new(1, "A", vec![]),
                TaskSpec::new(2, "B", vec![]),
                TaskSpec::new(3, "C", vec![]),
            ],
        ))
        .await
        .unwrap();
    let t = ids(&tasks);

    assert_eq!(s.launcher.tasks(), vec![t[0], t[1]]);
    assert_eq!(s.status(t[2]), TaskStatus::Ready);
    assert_eq!(s.reserved_slots(), 2);

    // deferrals leave no execution rows behind
    for _ in 0..5 {
        s.coordinator.reevaluate(Some("wide")).await;
    }
    assert_eq!(s.executions(t[2]), 0);
    assert!(s.db.lock_sync().unwrap().get_task(t[2]).unwrap().unwrap().execution_ref.is_none());

    s.complete(t[0]).await;
    assert_eq!(s.status(t[2]), TaskStatus::Running);
    assert_eq!(s.launcher.tasks(), vec![t[0], t[1], t[2]]);
    assert_eq!(s.executions(t[2]), 1);
}

#[tokio::test]
async fn test_repeated_failure_fails_task_and_blocks_dependents() {
    let mut s = scenario(2, 10).await;
    let tasks = s
        .coordinator
        .submit_feature(spec(
            "flaky",
            vec![
                TaskSpec::new(1, "Flaky", vec![]),
                TaskSpec::new(2, "Child", vec![1]),
                TaskSpec::new(3, "Grandchild", vec![2]),
                TaskSpec::new(4, "Bystander", vec![]),
            ],
        ))
        .await
        .unwrap();
    let t = ids(&tasks);

    for _ in 0..3 {
        assert_eq!(s.status(t[0]), TaskStatus::Running);
        s.fail(t[0], "tests failed").await;
    }

    assert_eq!(s.status(t[0]), TaskStatus::Failed);
    assert_eq!(s.status(t[1]), TaskStatus::Blocked);
    assert_eq!(s.status(t[2]), TaskStatus::Blocked);
    assert_eq!(s.status(t[3]), TaskStatus::Running);
    assert_eq!(s.launcher.tasks().iter().filter(|id| **id == t[0]).count(), 3);

    let notices = s.drain_notices();
    let retries = notices
        .iter()
        .filter(|n| matches!(n, Notice::TaskRetrying { .. }))
        .count();
    assert_eq!(retries, 3);
    let summary = notices
        .iter()
        .find_map(|n| match n {
            Notice::TaskFailed { summary } => Some(summary.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(summary.task_id, Some(t[0]));
    assert_eq!(summary.category, ErrorCategory::LoopExceeded);
    assert_eq!(summary.remaining_attempts, Some(0));
}

#[tokio::test]
async fn test_concurrent_launches_start_one_worker() {
    let s = scenario(0, 10).await;
    let tasks = s
        .coordinator
        .submit_feature(spec("race", vec![TaskSpec::new(1, "Only", vec![])]))
        .await
        .unwrap();
    assert!(s.launcher.tasks().is_empty());

    let task = tasks[0].clone();
    let (a, b) = tokio::join!(s.coordinator.launch(&task), s.coordinator.launch(&task));
    let outcomes = [a.unwrap(), b.unwrap()];

    let launched = outcomes
        .iter()
        .filter(|o| matches!(o, LaunchOutcome::Launched { .. }))
        .count();
    assert_eq!(launched, 1);
    assert!(outcomes.contains(&LaunchOutcome::Lost));
    assert_eq!(s.launcher.tasks(), vec![task.task_id]);
    assert_eq!(s.running(), 1);
}

#[tokio::test]
async fn test_restart_skips_work_whose_outputs_already_validate() {
    let s = scenario(2, 10).await;
    let tasks = s
        .coordinator
        .submit_feature(spec("resume", vec![TaskSpec::new(1, "Done before crash", vec![])]))
        .await
        .unwrap();
    let task_id = tasks[0].task_id;
    let execution_id = s.launcher.execution_of(task_id);

    let mut metadata = ExecutionMetadata::default();
    metadata
        .results
        .insert("generic".to_string(), serde_json::json!({"summary": "finished"}));
    s.db
        .lock_sync()
        .unwrap()
        .update_execution_metadata(&execution_id, &metadata)
        .unwrap();

    assert_eq!(s.coordinator.recover_interrupted().await.unwrap(), 1);
    assert_eq!(s.status(task_id), TaskStatus::Ready);

    s.coordinator.reevaluate(None).await;
    assert_eq!(s.status(task_id), TaskStatus::Completed);
    assert_eq!(s.launcher.tasks(), vec![task_id]);
    assert_eq!(s.feature_status("resume"), FeatureStatus::Completed);
}

#[tokio::test]
async fn test_retry_storm_trips_the_circuit() {
    let mut s = scenario(1, 10).await;
    let tasks = s
        .coordinator
        .submit_feature(spec(
            "storm",
            vec![
                TaskSpec::new(1, "Running", vec![]),
                TaskSpec::new(2, "Ready", vec![]),
                TaskSpec::new(3, "Queued", vec![1]),
            ],
        ))
        .await
        .unwrap();
    let t = ids(&tasks);
    assert_eq!(s.status(t[1]), TaskStatus::Ready);

    {
        let db = s.db.lock_sync().unwrap();
        for i in 0..12 {
            db.append_status_message("storm", Some(t[0]), &format!("[retry] attempt {} failed", i))
                .unwrap();
        }
    }
    s.coordinator.reevaluate(Some("storm")).await;

    assert_eq!(s.feature_status("storm"), FeatureStatus::Aborted);
    assert_eq!(s.status(t[0]), TaskStatus::Running);
    assert_eq!(s.status(t[1]), TaskStatus::Blocked);
    assert_eq!(s.status(t[2]), TaskStatus::Blocked);

    let aborted = s
        .drain_notices()
        .into_iter()
        .find_map(|n| match n {
            Notice::FeatureAborted { summary } => Some(summary),
            _ => None,
        })
        .unwrap();
    assert_eq!(aborted.category, ErrorCategory::CircuitTripped);
    assert_eq!(aborted.task_id, None);
}

#[tokio::test]
async fn test_missing_inputs_park_task_without_spending_an_attempt() {
    let mut s = scenario(2, 10).await;
    let mut implement = TaskSpec::new(1, "Implement without a plan", vec![]);
    implement.kind = TaskKind::Implement;
    let tasks = s
        .coordinator
        .submit_feature(spec(
            "unplanned",
            vec![implement, TaskSpec::new(2, "Follow-up", vec![1])],
        ))
        .await
        .unwrap();
    let t = ids(&tasks);

    assert_eq!(s.status(t[0]), TaskStatus::Blocked);
    assert_eq!(s.status(t[1]), TaskStatus::Blocked);
    assert!(s.launcher.tasks().is_empty());
    assert_eq!(s.workspaces.live.load(Ordering::SeqCst), 0);
    assert_eq!(s.reserved_slots(), 0);
    assert_eq!(s.executions(t[0]), 0);

    let summary = s
        .drain_notices()
        .into_iter()
        .find_map(|n| match n {
            Notice::TaskBlocked { summary } => Some(summary),
            _ => None,
        })
        .unwrap();
    assert_eq!(summary.task_id, Some(t[0]));
    assert_eq!(summary.category, ErrorCategory::PreconditionFailure);
    assert_eq!(summary.remaining_attempts, Some(3));
    assert!(summary.detail.contains("plan_path"));

    let logged = |s: &Scenario| {
        s.db.lock_sync()
            .unwrap()
            .recent_status_messages("unplanned", 100)
            .unwrap()
            .len()
    };
    let before = logged(&s);
    for _ in 0..10 {
        s.coordinator.reevaluate(Some("unplanned")).await;
    }
    assert_eq!(logged(&s), before);
    assert!(s.launcher.tasks().is_empty());
    assert!(s.drain_notices().is_empty());
}

#[tokio::test]
async fn test_allocation_failure_returns_task_to_ready_and_cools_down() {
    let s = scenario_with_cooldown(1, 10, Duration::from_secs(3600)).await;
    s.workspaces.fail.store(true, Ordering::SeqCst);
    let tasks = s
        .coordinator
        .submit_feature(spec("alloc", vec![TaskSpec::new(1, "Needs a worktree", vec![])]))
        .await
        .unwrap();
    let task_id = tasks[0].task_id;

    assert_eq!(s.status(task_id), TaskStatus::Ready);
    assert_eq!(s.reserved_slots(), 0);
    assert_eq!(s.executions(task_id), 0);
    assert!(s.launcher.tasks().is_empty());

    // the failure counts toward the cooldown even once allocation works again
    s.workspaces.fail.store(false, Ordering::SeqCst);
    s.coordinator.reevaluate(Some("alloc")).await;
    assert_eq!(s.status(task_id), TaskStatus::Ready);
    assert!(s.launcher.tasks().is_empty());
    assert_eq!(s.workspaces.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_run_is_rerun_even_when_it_reported_a_result() {
    let s = scenario(1, 10).await;
    let mut verify = TaskSpec::new(1, "Verify", vec![]);
    verify.kind = TaskKind::Verify;
    let tasks = s
        .coordinator
        .submit_feature(spec("regress", vec![verify]))
        .await
        .unwrap();
    let task_id = tasks[0].task_id;
    let first = s.launcher.execution_of(task_id);

    let mut reported = ExecutionMetadata::default();
    reported.set_result(TaskKind::Verify, serde_json::json!({"passed": 3, "failed": 2}));
    s.coordinator
        .handle_completion_event(
            task_id,
            TaskStatus::Failed,
            Some("2 checks failing".to_string()),
            Some(reported),
        )
        .await
        .unwrap();

    assert_eq!(s.status(task_id), TaskStatus::Running);
    assert_eq!(s.launcher.tasks(), vec![task_id, task_id]);
    assert_ne!(s.launcher.execution_of(task_id), first);

    let kept = s.db.lock_sync().unwrap().get_execution(&first).unwrap().unwrap();
    assert!(kept.metadata.result(TaskKind::Verify).is_none());
    assert_eq!(
        kept.metadata.extra.get("rejected_verify_result"),
        Some(&serde_json::json!({"passed": 3, "failed": 2}))
    );
}
