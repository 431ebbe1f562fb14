//! Thin async wrapper over the `git` CLI for worktree management.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::process::Command;

/// Runs git commands against one repository.
#[derive(Debug, Clone)]
pub struct Git {
    repo_dir: PathBuf,
}

impl Git {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Run `git <args>` in the repository, returning stdout on success and
    /// bailing with stderr otherwise.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run git {:?}", args))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn fetch(&self, remote: &str) -> Result<()> {
        self.run(&["fetch", remote]).await.map(|_| ())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", branch);
        let output = Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &refname])
            .current_dir(&self.repo_dir)
            .output()
            .await
            .context("Failed to run git show-ref")?;
        Ok(output.status.success())
    }

    /// `git worktree add -b <branch> <path> <base>`
    pub async fn add_worktree_new_branch(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path = path_str(path)?;
        self.run(&["worktree", "add", "-b", branch, path, base])
            .await
            .map(|_| ())
    }

    /// `git worktree add <path> <branch>` for a branch that already exists.
    pub async fn add_worktree_existing_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let path = path_str(path)?;
        self.run(&["worktree", "add", path, branch]).await.map(|_| ())
    }

    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path = path_str(path)?;
        self.run(&["worktree", "remove", "--force", path])
            .await
            .map(|_| ())
    }

    pub async fn prune_worktrees(&self) -> Result<()> {
        self.run(&["worktree", "prune"]).await.map(|_| ())
    }

    /// Re-link a worktree directory whose administrative files went missing.
    pub async fn repair_worktree(&self, path: &Path) -> Result<()> {
        let path = path_str(path)?;
        self.run(&["worktree", "repair", path]).await.map(|_| ())
    }

    /// Paths of every registered worktree, including the main checkout.
    pub async fn list_worktrees(&self) -> Result<Vec<PathBuf>> {
        let stdout = self.run(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&stdout))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().context("Worktree path contains invalid UTF-8")
}

/// Extract the `worktree <path>` entries from porcelain output.
pub fn parse_worktree_list(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}

/// Whether `err` came from git refusing to create a branch that exists.
pub fn is_branch_collision(err: &anyhow::Error) -> bool {
    let msg = format!("{:#}", err);
    msg.contains("already exists")
}
