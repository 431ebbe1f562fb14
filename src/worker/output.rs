//! Signal extraction from worker output.
//!
//! Workers report structured facts inline with tags:
//! - `<artifact key="plan_path">docs/plan.md</artifact>`
//! - `<result>{"files_changed": 3}</result>`
//! - `<resolved>2</resolved>` (remediation claims)
//! - `<status>text</status>` (progress notes for the status log)
//!
//! Output may be plain text or Claude `stream-json` lines; text is pulled out
//! of JSON events before tags are matched.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::util::extract_json_object;

static ARTIFACT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<artifact\s+key\s*=\s*"([^"]+)"\s*>\s*(.*?)\s*</artifact>"#).unwrap()
});

static RESULT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<result>\s*(.*?)\s*</result>").unwrap());

static RESOLVED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<resolved>\s*(\d+)\s*</resolved>").unwrap());

static STATUS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<status>\s*(.*?)\s*</status>").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerSignal {
    Artifact { key: String, path: String },
    Result(Value),
    Resolved(u32),
    Status(String),
}

pub struct OutputParser;

impl OutputParser {
    /// Human-readable text carried by one output line.
    ///
    /// JSON events contribute their `result` string or the `text` blocks of
    /// `message.content`; other JSON yields nothing; plain lines pass through.
    pub fn extract_text(line: &str) -> Option<String> {
        let trimmed = line.trim_end();
        if !trimmed.trim_start().starts_with('{') {
            return Some(trimmed.to_string());
        }
        let Ok(parsed) = serde_json::from_str::<Value>(trimmed) else {
            return Some(trimmed.to_string());
        };
        if parsed.get("type").is_none() {
            return Some(trimmed.to_string());
        }
        if let Some(result) = parsed.get("result").and_then(Value::as_str) {
            return Some(result.to_string());
        }
        let blocks = parsed
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)?;
        let text: Vec<&str> = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();
        (!text.is_empty()).then(|| text.join("\n"))
    }

    /// All signals in `text`, grouped by kind in order of appearance.
    pub fn parse(text: &str) -> Vec<WorkerSignal> {
        let mut signals = Vec::new();

        for cap in ARTIFACT_REGEX.captures_iter(text) {
            let path = cap[2].trim();
            if !path.is_empty() {
                signals.push(WorkerSignal::Artifact {
                    key: cap[1].to_string(),
                    path: path.to_string(),
                });
            }
        }

        for cap in RESULT_REGEX.captures_iter(text) {
            let raw = cap[1].trim();
            if raw.is_empty() {
                continue;
            }
            let value = serde_json::from_str::<Value>(raw)
                .ok()
                .or_else(|| extract_json_object(raw).and_then(|j| serde_json::from_str(j).ok()))
                .unwrap_or_else(|| Value::String(raw.to_string()));
            signals.push(WorkerSignal::Result(value));
        }

        for cap in RESOLVED_REGEX.captures_iter(text) {
            if let Ok(n) = cap[1].parse::<u32>() {
                signals.push(WorkerSignal::Resolved(n));
            }
        }

        for cap in STATUS_REGEX.captures_iter(text) {
            let status = cap[1].trim();
            if !status.is_empty() {
                signals.push(WorkerSignal::Status(status.to_string()));
            }
        }

        signals
    }
}
