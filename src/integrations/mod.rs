//! External collaborators the coordinator talks to but never depends on:
//! the issue tracker and the analytics sink. Failures here are logged by
//! the caller and never change task state.

pub mod analytics;
pub mod tracker;

pub use analytics::{AnalyticsSink, JsonlSink, PhaseRecord, seconds_since};
pub use tracker::{GhIssueTracker, IssueTracker, work_item_for};
