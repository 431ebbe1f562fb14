use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

/// Issue-tracker collaborator. Calls are at-least-once; callers log and
/// continue on error.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Create a standalone work item and return its external reference.
    async fn create_work_item(&self, title: &str, body: &str, labels: &[String]) -> Result<String>;
    async fn close(&self, external_ref: &str, comment: &str) -> Result<()>;
    async fn comment(&self, external_ref: &str, text: &str) -> Result<()>;
}

/// GitHub issues through the `gh` CLI. External refs are issue URLs.
pub struct GhIssueTracker {
    repo_dir: PathBuf,
}

impl GhIssueTracker {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run gh {}", args.first().copied().unwrap_or("")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh {} failed: {}", args.join(" "), stderr.trim());
        }
        String::from_utf8(output.stdout).context("Invalid UTF-8 in gh output")
    }
}

#[async_trait]
impl IssueTracker for GhIssueTracker {
    async fn create_work_item(&self, title: &str, body: &str, labels: &[String]) -> Result<String> {
        let mut args = vec!["issue", "create", "--title", title, "--body", body];
        for label in labels {
            args.push("--label");
            args.push(label);
        }
        let stdout = self.gh(&args).await?;
        parse_issue_url(&stdout).context("gh issue create printed no issue URL")
    }

    async fn close(&self, external_ref: &str, comment: &str) -> Result<()> {
        self.gh(&["issue", "close", external_ref, "--comment", comment])
            .await
            .map(|_| ())
    }

    async fn comment(&self, external_ref: &str, text: &str) -> Result<()> {
        self.gh(&["issue", "comment", external_ref, "--body", text])
            .await
            .map(|_| ())
    }
}

/// The last line of `gh issue create` output that looks like a URL.
pub fn parse_issue_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|l| l.starts_with("https://") || l.starts_with("http://"))
        .map(String::from)
}

/// Title and body for a task's work item. Tasks are linked only through
/// feature and sequence metadata, never to a parent item.
pub fn work_item_for(feature_id: &str, sequence_number: i64, title: &str, payload: &str) -> (String, String) {
    let item_title = format!("[{}#{}] {}", feature_id, sequence_number, title);
    let body = format!(
        "{}\n\n---\nfeature: `{}`\nsequence: {}\n",
        if payload.trim().is_empty() {
            "No description provided."
        } else {
            payload.trim()
        },
        feature_id,
        sequence_number
    );
    (item_title, body)
}
