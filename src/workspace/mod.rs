//! Workspace Manager: one git worktree per execution.
//!
//! Worktrees live under `<workspace root>/<execution_id>` on a branch named
//! after the task. [`WorkspaceManager::validate`] runs the three-way check
//! in [`reconcile`] and applies the chosen repair; `remove` never fails from
//! the caller's point of view.

pub mod artifacts;
pub mod git;
pub mod reconcile;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::WorkspaceSection;
use crate::errors::OrchestrationError;
use crate::store::DbHandle;
use crate::util::slugify;

pub use artifacts::preserve_artifacts;
pub use git::Git;
pub use reconcile::{Reconciliation, Repair, WorkspaceFacts, reconcile};

/// Branch name for a task's workspace: `conductor/<feature>-<seq>-<title>`.
pub fn branch_name(feature_id: &str, sequence_number: i64, title: &str) -> String {
    let feature = slugify(feature_id, 30);
    let title = slugify(title, 30);
    if title.is_empty() {
        format!("conductor/{}-{}", feature, sequence_number)
    } else {
        format!("conductor/{}-{}-{}", feature, sequence_number, title)
    }
}

/// Allocates and frees the isolated checkout an execution works in.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn create(&self, execution_id: &str, branch: &str) -> Result<PathBuf, OrchestrationError>;
    /// Best effort; failures are logged, never returned.
    async fn remove(&self, execution_id: &str);
}

#[derive(Clone)]
pub struct WorkspaceManager {
    db: DbHandle,
    git: Git,
    root: PathBuf,
    config: WorkspaceSection,
}

impl WorkspaceManager {
    /// `repo_dir` is the main checkout; `root` holds the per-execution
    /// worktrees and is created if missing.
    pub fn new(db: DbHandle, repo_dir: &Path, root: &Path, config: WorkspaceSection) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;
        let root = root
            .canonicalize()
            .context("Failed to resolve workspace root")?;
        Ok(Self {
            db,
            git: Git::new(repo_dir),
            root,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_path(&self, execution_id: &str) -> PathBuf {
        self.root.join(execution_id)
    }

    /// Fetch upstream, then check out `branch` in a fresh worktree for this
    /// execution. An existing branch is attached instead of recreated.
    pub async fn create(&self, execution_id: &str, branch: &str) -> Result<PathBuf, OrchestrationError> {
        self.create_inner(execution_id, branch)
            .await
            .map_err(|source| OrchestrationError::AllocationFailure {
                execution_id: execution_id.to_string(),
                source,
            })
    }

    async fn create_inner(&self, execution_id: &str, branch: &str) -> Result<PathBuf> {
        let base = self.resolve_base().await;
        let path = self.workspace_path(execution_id);

        match self.git.add_worktree_new_branch(&path, branch, &base).await {
            Ok(()) => {}
            Err(e) if git::is_branch_collision(&e) && !path.exists() => {
                debug!(execution_id, branch, "Branch exists; attaching worktree to it");
                self.git
                    .add_worktree_existing_branch(&path, branch)
                    .await
                    .context("Failed to attach worktree to existing branch")?;
            }
            Err(e) => return Err(e.context("Failed to create git worktree")),
        }

        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?
            .to_string();
        let id = execution_id.to_string();
        let branch_owned = branch.to_string();
        self.db
            .call(move |db| db.set_execution_workspace(&id, Some(&path_str), Some(&branch_owned)))
            .await?;

        info!(execution_id, branch, path = %path.display(), "Created workspace");
        Ok(path)
    }

    /// Remote-tracking base when a fetch succeeds, local base otherwise.
    async fn resolve_base(&self) -> String {
        let local = self.config.base_branch.clone();
        if !self.config.fetch {
            return local;
        }
        if let Err(e) = self.git.fetch(&self.config.remote).await {
            warn!(remote = %self.config.remote, "Fetch failed, using local base branch: {:#}", e);
            return local;
        }
        let remote_ref = format!("{}/{}", self.config.remote, self.config.base_branch);
        match self
            .git
            .run(&["rev-parse", "--verify", "--quiet", &remote_ref])
            .await
        {
            Ok(_) => remote_ref,
            Err(_) => local,
        }
    }

    /// Gather the three facts for this execution's workspace.
    async fn facts(&self, execution_id: &str) -> Result<(WorkspaceFacts, PathBuf, Option<String>)> {
        let id = execution_id.to_string();
        let execution = self.db.call(move |db| db.get_execution(&id)).await?;
        let (recorded, branch) = match &execution {
            Some(exec) => (exec.workspace_path.clone(), exec.branch_name.clone()),
            None => (None, None),
        };
        let path = recorded
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace_path(execution_id));

        let registered_paths = self.git.list_worktrees().await?;
        let wanted = normalize(&path);
        let registered = registered_paths.iter().any(|p| normalize(p) == wanted);

        let facts = WorkspaceFacts {
            recorded: recorded.is_some(),
            exists_on_disk: path.is_dir(),
            registered,
        };
        Ok((facts, path, branch))
    }

    /// Three-way consistency check with self-healing.
    pub async fn validate(&self, execution_id: &str) -> Result<Reconciliation> {
        let (facts, path, branch) = self.facts(execution_id).await?;
        let outcome = reconcile(facts);

        let Reconciliation::Repaired { repair } = &outcome else {
            debug!(execution_id, %outcome, "Workspace checked");
            return Ok(outcome);
        };

        let applied = match repair {
            Repair::RecordPath => {
                let path_str = path
                    .to_str()
                    .context("Worktree path contains invalid UTF-8")?
                    .to_string();
                let id = execution_id.to_string();
                self.db
                    .call(move |db| db.set_execution_workspace(&id, Some(&path_str), None))
                    .await
            }
            Repair::RecreateDirectory => match branch {
                Some(branch) => {
                    self.git.prune_worktrees().await?;
                    self.git.add_worktree_existing_branch(&path, &branch).await
                }
                None => Err(anyhow::anyhow!("no branch recorded to recreate the workspace from")),
            },
            Repair::Reregister => {
                self.git.repair_worktree(&path).await?;
                let listed = self.git.list_worktrees().await?;
                let wanted = normalize(&path);
                if listed.iter().any(|p| normalize(p) == wanted) {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("git could not re-link the worktree"))
                }
            }
        };

        match applied {
            Ok(()) => {
                info!(execution_id, ?repair, "Repaired workspace");
                Ok(outcome)
            }
            Err(e) => {
                warn!(execution_id, ?repair, "Workspace repair failed: {:#}", e);
                Ok(Reconciliation::Invalid {
                    reason: format!("repair {:?} failed: {:#}", repair, e),
                })
            }
        }
    }

    /// Remove the workspace through git, falling back to deleting the
    /// directory. A missing workspace counts as removed.
    pub async fn remove(&self, execution_id: &str) {
        if let Err(e) = self.remove_inner(execution_id).await {
            warn!(execution_id, "Workspace removal incomplete: {:#}", e);
        }
    }

    async fn remove_inner(&self, execution_id: &str) -> Result<()> {
        let (facts, path, _) = self.facts(execution_id).await?;

        if facts.exists_on_disk || facts.registered {
            if let Err(e) = self.git.remove_worktree(&path).await {
                debug!(execution_id, "git worktree remove failed, deleting directory: {:#}", e);
                if path.exists() {
                    tokio::fs::remove_dir_all(&path)
                        .await
                        .with_context(|| format!("Failed to delete {}", path.display()))?;
                }
                self.git.prune_worktrees().await?;
            }
            info!(execution_id, path = %path.display(), "Removed workspace");
        }

        if facts.recorded {
            let id = execution_id.to_string();
            self.db
                .call(move |db| db.set_execution_workspace(&id, None, None))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceProvider for WorkspaceManager {
    async fn create(&self, execution_id: &str, branch: &str) -> Result<PathBuf, OrchestrationError> {
        WorkspaceManager::create(self, execution_id, branch).await
    }

    async fn remove(&self, execution_id: &str) {
        WorkspaceManager::remove(self, execution_id).await
    }
}

/// Resolve symlinks where possible so paths from git compare equal to ours.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
