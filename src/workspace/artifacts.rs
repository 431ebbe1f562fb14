use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::store::DbHandle;

/// Copy artifacts that live inside an execution's workspace to
/// `<dest_root>/<execution_id>/` and record their new absolute paths.
///
/// Runs before the workspace is removed so downstream tasks can still read
/// what this one produced. Artifacts outside the workspace and files that no
/// longer exist are left as recorded. Returns the number of files copied.
pub async fn preserve_artifacts(db: &DbHandle, execution_id: &str, dest_root: &Path) -> Result<usize> {
    let id = execution_id.to_string();
    let Some(execution) = db.call(move |db| db.get_execution(&id)).await? else {
        return Ok(0);
    };
    let Some(workspace) = execution.workspace_path.as_deref().map(PathBuf::from) else {
        return Ok(0);
    };

    let dest_dir = dest_root.join(execution_id);
    let mut metadata = execution.metadata.clone();
    let mut copied = 0;

    for (key, raw) in &execution.metadata.artifacts {
        let Some(relative) = relative_to_workspace(Path::new(raw), &workspace) else {
            continue;
        };
        let source = workspace.join(&relative);
        if !source.is_file() {
            debug!(execution_id, key, path = %source.display(), "Artifact missing, not preserved");
            continue;
        }
        let target = dest_dir.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::copy(&source, &target)
            .await
            .with_context(|| format!("Failed to copy artifact '{}' to {}", key, target.display()))?;
        let target_str = target
            .to_str()
            .context("Artifact path contains invalid UTF-8")?;
        metadata.set_artifact(key, target_str);
        copied += 1;
    }

    if copied > 0 {
        let id = execution_id.to_string();
        db.call(move |db| db.update_execution_metadata(&id, &metadata))
            .await?;
        info!(execution_id, copied, dest = %dest_dir.display(), "Preserved artifacts");
    }
    Ok(copied)
}

fn relative_to_workspace(path: &Path, workspace: &Path) -> Option<PathBuf> {
    if path.is_relative() {
        // `..` would escape the workspace
        if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return None;
        }
        return Some(path.to_path_buf());
    }
    path.strip_prefix(workspace).ok().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutionMetadata, FeatureSpec, TaskSpec};
    use tempfile::TempDir;

    fn setup(workspace: &Path, artifacts: &[(&str, &str)]) -> DbHandle {
        let db = DbHandle::in_memory().unwrap();
        let store = db.lock_sync().unwrap();
        let tasks = store
            .submit_feature(&FeatureSpec {
                feature_id: "f".into(),
                title: String::new(),
                tasks: vec![TaskSpec::new(1, "plan", vec![])],
            })
            .unwrap();
        let mut metadata = ExecutionMetadata::default();
        for (key, path) in artifacts {
            metadata.set_artifact(key, path);
        }
        store.create_execution("e1", tasks[0].task_id, &metadata).unwrap();
        store
            .set_execution_workspace("e1", workspace.to_str(), Some("conductor/f-1"))
            .unwrap();
        drop(store);
        db
    }

    #[tokio::test]
    async fn test_copies_workspace_artifacts_and_rewrites_paths() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(ws.join("docs")).unwrap();
        std::fs::write(ws.join("docs/plan.md"), "the plan").unwrap();
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, "x").unwrap();

        let db = setup(
            &ws,
            &[
                ("plan_path", "docs/plan.md"),
                ("other", outside.to_str().unwrap()),
                ("gone", "missing.txt"),
            ],
        );
        let dest = dir.path().join("artifacts");
        let copied = preserve_artifacts(&db, "e1", &dest).await.unwrap();
        assert_eq!(copied, 1);

        let exec = db.lock_sync().unwrap().get_execution("e1").unwrap().unwrap();
        let plan = exec.metadata.artifact("plan_path").unwrap();
        assert_eq!(Path::new(plan), dest.join("e1/docs/plan.md"));
        assert_eq!(std::fs::read_to_string(plan).unwrap(), "the plan");
        assert_eq!(exec.metadata.artifact("other"), outside.to_str());
        assert_eq!(exec.metadata.artifact("gone"), Some("missing.txt"));
    }

    #[tokio::test]
    async fn test_absolute_path_inside_workspace_is_preserved() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let plan = ws.join("plan.md");
        std::fs::write(&plan, "abs").unwrap();

        let db = setup(&ws, &[("plan_path", plan.to_str().unwrap())]);
        let dest = dir.path().join("artifacts");
        assert_eq!(preserve_artifacts(&db, "e1", &dest).await.unwrap(), 1);
        assert!(dest.join("e1/plan.md").is_file());
    }

    #[tokio::test]
    async fn test_unknown_execution_copies_nothing() {
        let db = DbHandle::in_memory().unwrap();
        let dir = TempDir::new().unwrap();
        assert_eq!(preserve_artifacts(&db, "nope", dir.path()).await.unwrap(), 0);
    }

    #[test]
    fn test_parent_components_are_not_followed() {
        assert_eq!(relative_to_workspace(Path::new("../escape"), Path::new("/ws")), None);
        assert_eq!(
            relative_to_workspace(Path::new("/ws/a/b"), Path::new("/ws")),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(relative_to_workspace(Path::new("/elsewhere"), Path::new("/ws")), None);
    }
}
