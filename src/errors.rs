//! Typed error taxonomy for the orchestration core.
//!
//! `OrchestrationError` carries the categories the coordinator reasons about.
//! `ResourceExhausted` and `AllocationFailure` are retried automatically on a
//! later event. A `PreconditionFailure` found before anything is allocated
//! parks the task as blocked. `LoopExceeded` and `CircuitTripped` fail the
//! task or its feature outright.
//! Anything that stops a task is surfaced through a [`TerminalSummary`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("{pool} pool exhausted: all {capacity} slots are reserved")]
    ResourceExhausted { pool: &'static str, capacity: u32 },

    #[error("Failed to allocate resources for execution {execution_id}: {source}")]
    AllocationFailure {
        execution_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Preconditions for {kind} task {task_id} not met: {}", .violations.join("; "))]
    PreconditionFailure {
        task_id: i64,
        kind: String,
        violations: Vec<String>,
    },

    #[error("Remediation made no measured progress: {failed_before} failing before, {failed_after} after")]
    VerificationRegression {
        failed_before: usize,
        failed_after: usize,
    },

    #[error("Task {task_id} exhausted {attempts} launch attempts")]
    LoopExceeded { task_id: i64, attempts: u32 },

    #[error("Circuit breaker tripped for feature {feature_id}: {hits} of the last {window} messages are retries")]
    CircuitTripped {
        feature_id: String,
        hits: usize,
        window: usize,
    },

    #[error("Invalid task graph for feature {feature_id}: {message}")]
    InvalidGraph { feature_id: String, message: String },

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used in logs, status messages and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ResourceExhausted,
    AllocationFailure,
    PreconditionFailure,
    VerificationRegression,
    LoopExceeded,
    CircuitTripped,
    InvalidInput,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceExhausted => "resource_exhausted",
            Self::AllocationFailure => "allocation_failure",
            Self::PreconditionFailure => "precondition_failure",
            Self::VerificationRegression => "verification_regression",
            Self::LoopExceeded => "loop_exceeded",
            Self::CircuitTripped => "circuit_tripped",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OrchestrationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
            Self::AllocationFailure { .. } => ErrorCategory::AllocationFailure,
            Self::PreconditionFailure { .. } => ErrorCategory::PreconditionFailure,
            Self::VerificationRegression { .. } => ErrorCategory::VerificationRegression,
            Self::LoopExceeded { .. } => ErrorCategory::LoopExceeded,
            Self::CircuitTripped { .. } => ErrorCategory::CircuitTripped,
            Self::InvalidGraph { .. } | Self::TaskNotFound { .. } => ErrorCategory::InvalidInput,
            Self::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Terminal errors need manual intervention and are never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoopExceeded { .. } | Self::CircuitTripped { .. })
    }

    /// Recoverable errors leave the task eligible for a later launch.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::AllocationFailure { .. }
        )
    }
}

/// Human-readable account of a terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminalSummary {
    pub task_id: Option<i64>,
    pub feature_id: String,
    /// Phase (task kind) that failed.
    pub phase: String,
    pub category: ErrorCategory,
    pub detail: String,
    /// `None` when the failure has no attempt budget (feature-wide abort).
    pub remaining_attempts: Option<u32>,
}

impl TerminalSummary {
    pub fn from_error(
        feature_id: &str,
        task_id: Option<i64>,
        phase: &str,
        err: &OrchestrationError,
        remaining_attempts: Option<u32>,
    ) -> Self {
        Self {
            task_id,
            feature_id: feature_id.to_string(),
            phase: phase.to_string(),
            category: err.category(),
            detail: err.to_string(),
            remaining_attempts,
        }
    }
}

impl fmt::Display for TerminalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.task_id {
            Some(id) => write!(f, "Task {} ({} phase) of feature {}", id, self.phase, self.feature_id)?,
            None => write!(f, "Feature {} ({} phase)", self.feature_id, self.phase)?,
        }
        let outcome = match self.category {
            ErrorCategory::PreconditionFailure => "was blocked",
            _ => "failed",
        };
        write!(f, " {} [{}]: {}", outcome, self.category, self.detail)?;
        match self.remaining_attempts {
            Some(n) => write!(f, " ({} attempts remaining)", n),
            None => write!(f, " (no attempt budget; manual review required)"),
        }
    }
}
