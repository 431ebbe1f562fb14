use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::output::{OutputParser, WorkerSignal};
use crate::store::PortPair;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub task_id: i64,
    pub execution_id: String,
    pub working_dir: PathBuf,
    pub prompt: String,
    pub ports: Option<PortPair>,
}

/// What an invocation produced, as reported by the worker's signals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub artifacts: BTreeMap<String, String>,
    /// The last `<result>` emitted, if any.
    pub result: Option<Value>,
    /// The last `<resolved>` claim, if any.
    pub resolved: Option<u32>,
    pub messages: Vec<String>,
    pub stderr: String,
}

impl InvocationOutput {
    /// Fold parsed signals into the output.
    pub fn absorb(&mut self, signals: Vec<WorkerSignal>) {
        for signal in signals {
            match signal {
                WorkerSignal::Artifact { key, path } => {
                    self.artifacts.insert(key, path);
                }
                WorkerSignal::Result(value) => self.result = Some(value),
                WorkerSignal::Resolved(n) => self.resolved = Some(n),
                WorkerSignal::Status(text) => {
                    if self.messages.last() != Some(&text) {
                        self.messages.push(text);
                    }
                }
            }
        }
    }
}

/// The external worker. Implementations run to completion; detaching is
/// the launcher's job.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput>;
}

/// Runs the configured agent CLI as a subprocess:
/// `<cmd> --print <args..> -p <prompt>`.
pub struct ProcessInvoker {
    cmd: String,
    args: Vec<String>,
}

impl ProcessInvoker {
    pub fn new(cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentInvoker for ProcessInvoker {
    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput> {
        let mut cmd = Command::new(&self.cmd);
        cmd.arg("--print")
            .args(&self.args)
            .arg("-p")
            .arg(&request.prompt)
            .current_dir(&request.working_dir)
            .env("CONDUCTOR_TASK_ID", request.task_id.to_string())
            .env("CONDUCTOR_EXECUTION_ID", &request.execution_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ports) = request.ports {
            cmd.env("CONDUCTOR_BACKEND_PORT", ports.backend.to_string())
                .env("CONDUCTOR_FRONTEND_PORT", ports.frontend.to_string());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker command '{}'", self.cmd))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut text = String::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .context("Failed to read worker output")?
            {
                if let Some(chunk) = OutputParser::extract_text(&line) {
                    debug!(task_id = request.task_id, "worker: {}", chunk);
                    text.push_str(&chunk);
                    text.push('\n');
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for worker")?;
        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            warn!(
                task_id = request.task_id,
                code = status.code().unwrap_or(-1),
                "Worker exited unsuccessfully: {}",
                stderr.trim()
            );
        }

        let mut output = InvocationOutput {
            success: status.success(),
            exit_code: status.code(),
            stderr,
            ..Default::default()
        };
        output.absorb(OutputParser::parse(&text));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn request(dir: &TempDir, prompt: &str) -> InvocationRequest {
        InvocationRequest {
            task_id: 1,
            execution_id: "e1".into(),
            working_dir: dir.path().to_path_buf(),
            prompt: prompt.into(),
            ports: Some(PortPair {
                backend: 8000,
                frontend: 9000,
            }),
        }
    }

    /// Write an executable shell script standing in for the agent CLI. It
    /// receives `--print -p <prompt>` as arguments and ignores them.
    fn script_worker(dir: &Path, script: &str) -> ProcessInvoker {
        let path = dir.join(format!("worker-{}.sh", uuid::Uuid::new_v4()));
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        ProcessInvoker::new(path.to_string_lossy().into_owned(), vec![])
    }

    #[tokio::test]
    async fn test_process_invoker_collects_signals() {
        let dir = TempDir::new().unwrap();
        let worker = script_worker(
            dir.path(),
            r#"echo "<status>started $CONDUCTOR_TASK_ID on $CONDUCTOR_BACKEND_PORT</status>"
echo '<artifact key="plan_path">plan.md</artifact>'
echo '<result>{"ok": true}</result>'"#,
        );
        let output = worker.invoke(&request(&dir, "do it")).await.unwrap();
        assert!(output.success);
        assert_eq!(output.messages, vec!["started 1 on 8000".to_string()]);
        assert_eq!(output.artifacts.get("plan_path").map(String::as_str), Some("plan.md"));
        assert_eq!(output.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_process_invoker_reports_failure() {
        let dir = TempDir::new().unwrap();
        let worker = script_worker(dir.path(), "echo boom >&2; exit 3");
        let output = worker.invoke(&request(&dir, "x")).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert!(output.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_command_is_an_error() {
        let dir = TempDir::new().unwrap();
        let worker = ProcessInvoker::new("/nonexistent/conductor-worker", vec![]);
        assert!(worker.invoke(&request(&dir, "x")).await.is_err());
    }

    #[test]
    fn test_absorb_keeps_last_result_and_dedupes_status() {
        let mut output = InvocationOutput::default();
        output.absorb(vec![
            WorkerSignal::Result(json!(1)),
            WorkerSignal::Result(json!(2)),
            WorkerSignal::Status("a".into()),
            WorkerSignal::Status("a".into()),
            WorkerSignal::Resolved(4),
        ]);
        assert_eq!(output.result, Some(json!(2)));
        assert_eq!(output.messages, vec!["a".to_string()]);
        assert_eq!(output.resolved, Some(4));
    }
}
