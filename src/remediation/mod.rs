//! Verification-gated remediation loop.
//!
//! A [`Check`] reports pass/fail per item; a [`Remediator`] tries to fix the
//! failing ones and says how many it believes it resolved. The loop only
//! continues while an independent re-run of the check shows fewer failures
//! than before. The remediator's own claim can stop the loop but never
//! extend it.

mod agent;
mod command;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::OrchestrationError;

pub use agent::AgentRemediator;
pub use command::{CommandCheck, parse_check_output};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckItem {
    pub name: String,
    pub passed: bool,
}

/// One run of a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub items: Vec<CheckItem>,
    pub failed: usize,
}

impl CheckReport {
    pub fn from_items(items: Vec<CheckItem>) -> Self {
        let failed = items.iter().filter(|i| !i.passed).count();
        Self { items, failed }
    }

    pub fn failing(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| !i.passed)
            .map(|i| i.name.clone())
            .collect()
    }

    pub fn passed(&self) -> usize {
        self.items.len().saturating_sub(self.failed)
    }
}

#[async_trait]
pub trait Check: Send + Sync {
    async fn run(&self) -> Result<CheckReport>;
}

#[async_trait]
pub trait Remediator: Send + Sync {
    /// Attempt to fix `failing`; returns the number of items the remediator
    /// claims to have resolved.
    async fn remediate(&self, failing: &[String]) -> Result<u32>;
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No failures remain.
    Passed,
    /// The remediator claimed to resolve nothing.
    NoClaimedProgress,
    /// The re-run did not show fewer failures.
    NoMeasuredProgress,
    /// The iteration budget ran out while still improving.
    IterationLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub report: CheckReport,
    pub iterations: u32,
    pub stop: StopReason,
    /// Failure counts around the final iteration, when one ran.
    pub failed_before: Option<usize>,
}

impl RemediationOutcome {
    pub fn succeeded(&self) -> bool {
        self.report.failed == 0
    }

    /// The regression the loop stopped on, for reporting. Not raised.
    pub fn regression(&self) -> Option<OrchestrationError> {
        match (self.stop, self.failed_before) {
            (StopReason::NoMeasuredProgress, Some(before)) => {
                Some(OrchestrationError::VerificationRegression {
                    failed_before: before,
                    failed_after: self.report.failed,
                })
            }
            _ => None,
        }
    }
}

pub struct RemediationLoop<'a> {
    check: &'a dyn Check,
    remediator: &'a dyn Remediator,
    max_iterations: u32,
}

impl<'a> RemediationLoop<'a> {
    pub fn new(check: &'a dyn Check, remediator: &'a dyn Remediator, max_iterations: u32) -> Self {
        Self {
            check,
            remediator,
            max_iterations,
        }
    }

    pub async fn run(&self) -> Result<RemediationOutcome> {
        let mut iterations = 0;
        let mut report = self.check.run().await?;
        let mut failed_before = None;

        let stop = loop {
            if report.failed == 0 {
                break StopReason::Passed;
            }
            if iterations >= self.max_iterations {
                break StopReason::IterationLimit;
            }
            iterations += 1;
            let previous = report.failed;

            let claimed = self.remediator.remediate(&report.failing()).await?;
            debug!(iteration = iterations, failing = previous, claimed, "Remediation attempt finished");
            if claimed == 0 {
                break StopReason::NoClaimedProgress;
            }

            report = self.check.run().await?;
            failed_before = Some(previous);
            if report.failed >= previous {
                info!(
                    iteration = iterations,
                    failed_before = previous,
                    failed_after = report.failed,
                    claimed,
                    "Remediation claimed fixes but the check shows no improvement"
                );
                break StopReason::NoMeasuredProgress;
            }
        };

        Ok(RemediationOutcome {
            report,
            iterations,
            stop,
            failed_before,
        })
    }
}
