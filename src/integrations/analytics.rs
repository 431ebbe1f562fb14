use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::store::TaskKind;

/// One finished phase, as seen by the analytics collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub task_id: i64,
    pub feature_id: String,
    pub phase_kind: TaskKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Write-only sink; the core never reads records back.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(&self, record: &PhaseRecord) -> Result<()>;
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AnalyticsSink for JsonlSink {
    async fn record(&self, record: &PhaseRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize analytics record")?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write analytics record")?;
        Ok(())
    }
}

/// Seconds between a store timestamp (`YYYY-MM-DD HH:MM:SS`, UTC) and `now`.
pub fn seconds_since(started_at: &str, now: DateTime<Utc>) -> Option<f64> {
    let started = NaiveDateTime::parse_from_str(started_at, "%Y-%m-%d %H:%M:%S")
        .ok()?
        .and_utc();
    let millis = now.signed_duration_since(started).num_milliseconds();
    (millis >= 0).then(|| millis as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(task_id: i64, success: bool) -> PhaseRecord {
        PhaseRecord {
            task_id,
            feature_id: "f".into(),
            phase_kind: TaskKind::Implement,
            success,
            duration_secs: Some(1.5),
            error: (!success).then(|| "boom".to_string()),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("analytics.jsonl");
        let sink = JsonlSink::new(&path);
        sink.record(&record(1, true)).await.unwrap();
        sink.record(&record(2, false)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<PhaseRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].error.as_deref(), Some("boom"));
        assert_eq!(lines[0].phase_kind, TaskKind::Implement);
        assert!(!content.lines().next().unwrap().contains("\"error\""));
    }

    #[test]
    fn test_seconds_since() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 10).unwrap();
        assert_eq!(seconds_since("2026-01-02 03:04:05", now), Some(5.0));
        assert_eq!(seconds_since("2026-01-02 03:04:15", now), None);
        assert_eq!(seconds_since("garbage", now), None);
    }
}
