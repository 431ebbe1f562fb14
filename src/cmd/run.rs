//! Coordinator loop command: `conductor run`.

use std::path::Path;

use anyhow::Result;
use conductor::coordinator::{Coordinator, Notice, RunOptions};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::open_project;

pub async fn cmd_run(project_dir: &Path, concurrency: Option<usize>, until_idle: bool) -> Result<()> {
    let (config, db) = open_project(project_dir, concurrency)?;
    for warning in config.validate() {
        warn!("Configuration: {}", warning);
    }

    let (coordinator, events) = Coordinator::from_config(&config, db).await?;

    let mut notices = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => println!("{}", describe(&notice)),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notice output fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let handle = coordinator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = handle.shutdown();
        }
    });

    println!(
        "Coordinator running with concurrency limit {}{}",
        coordinator.concurrency_limit(),
        if until_idle { " until idle" } else { "; press Ctrl-C to stop" }
    );
    let result = coordinator
        .run(
            events,
            RunOptions {
                sweep_interval: config.toml.coordinator.sweep_interval(),
                until_idle,
            },
        )
        .await;

    drop(coordinator);
    let _ = printer.await;
    result
}

/// One line of human output per notice.
fn describe(notice: &Notice) -> String {
    match notice {
        Notice::TaskLaunched {
            task_id,
            feature_id,
            execution_id,
        } => format!("[{}] task {} launched (execution {})", feature_id, task_id, execution_id),
        Notice::TaskCompleted { task_id, feature_id } => {
            format!("[{}] task {} completed", feature_id, task_id)
        }
        Notice::TaskRetrying {
            task_id,
            feature_id,
            error,
            remaining_attempts,
        } => format!(
            "[{}] task {} failed, {} attempts left: {}",
            feature_id, task_id, remaining_attempts, error
        ),
        Notice::TaskFailed { summary } | Notice::TaskBlocked { summary } => {
            format!("[{}] {}", summary.feature_id, summary)
        }
        Notice::FeatureCompleted { feature_id } => format!("[{}] feature completed", feature_id),
        Notice::FeatureAborted { summary } => format!("[{}] {}", summary.feature_id, summary),
    }
}
