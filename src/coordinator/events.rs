use serde::{Deserialize, Serialize};

use crate::errors::TerminalSummary;
use crate::store::{ExecutionMetadata, TaskStatus};

/// Inbound events consumed by the coordinator loop.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A worker finished a task.
    Completion {
        task_id: i64,
        status: TaskStatus,
        error: Option<String>,
        /// Metadata reported alongside the completion, merged into the
        /// task's execution.
        metadata: Option<ExecutionMetadata>,
    },
    /// Re-run readiness and dispatch for one feature, or all of them.
    Reevaluate { feature_id: Option<String> },
    Shutdown,
}

/// Outbound notifications for subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    TaskLaunched {
        task_id: i64,
        feature_id: String,
        execution_id: String,
    },
    TaskCompleted {
        task_id: i64,
        feature_id: String,
    },
    /// A run failed and the task went back to `ready` for another attempt.
    TaskRetrying {
        task_id: i64,
        feature_id: String,
        error: String,
        remaining_attempts: u32,
    },
    /// The task failed permanently.
    TaskFailed {
        summary: TerminalSummary,
    },
    /// The task's inputs can never be satisfied; it was parked as `blocked`
    /// without spending an attempt.
    TaskBlocked {
        summary: TerminalSummary,
    },
    FeatureCompleted {
        feature_id: String,
    },
    FeatureAborted {
        summary: TerminalSummary,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;

    #[test]
    fn test_notice_serializes_with_type_tag() {
        let notice = Notice::FeatureCompleted {
            feature_id: "f1".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "feature_completed");
        assert_eq!(json["feature_id"], "f1");

        let failed = Notice::TaskFailed {
            summary: TerminalSummary {
                task_id: Some(3),
                feature_id: "f1".into(),
                phase: "implement".into(),
                category: ErrorCategory::LoopExceeded,
                detail: "Task 3 exhausted 3 launch attempts".into(),
                remaining_attempts: Some(0),
            },
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["type"], "task_failed");
        assert_eq!(json["summary"]["task_id"], 3);
    }
}
