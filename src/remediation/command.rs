use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use super::{Check, CheckItem, CheckReport};

// `test name ... ok` / `test name ... FAILED` (libtest)
static LIBTEST_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^test (\S+) \.\.\. (ok|FAILED)").unwrap());

// `ok 3 - name` / `not ok 4 - name` (TAP)
static TAP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(not ok|ok)\s+\d+\s*(?:-\s*)?(.*)$").unwrap());

/// Turn check output into per-item results. Lines in neither libtest nor
/// TAP form are ignored.
pub fn parse_check_output(output: &str) -> Vec<CheckItem> {
    let mut items = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(cap) = LIBTEST_REGEX.captures(line) {
            items.push(CheckItem {
                name: cap[1].to_string(),
                passed: &cap[2] == "ok",
            });
        } else if let Some(cap) = TAP_REGEX.captures(line) {
            items.push(CheckItem {
                name: cap[2].trim().to_string(),
                passed: &cap[1] == "ok",
            });
        }
    }
    items
}

/// Runs a shell command in a workspace and reads pass/fail items from its
/// output. A failing exit with no failing items counts as one failure.
pub struct CommandCheck {
    command: String,
    working_dir: PathBuf,
}

impl CommandCheck {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl Check for CommandCheck {
    async fn run(&self) -> Result<CheckReport> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run check command: {}", self.command))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut items = parse_check_output(&stdout);
        let any_failed = items.iter().any(|i| !i.passed);
        if !output.status.success() && !any_failed {
            items.push(CheckItem {
                name: format!(
                    "`{}` exited with status {}",
                    self.command,
                    output.status.code().unwrap_or(-1)
                ),
                passed: false,
            });
        }

        let report = CheckReport::from_items(items);
        debug!(command = %self.command, items = report.items.len(), failed = report.failed, "Check finished");
        Ok(report)
    }
}
