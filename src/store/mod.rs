//! Durable task store and dependency graph.
//!
//! ## Overview
//!
//! Every piece of coordination state lives here so the coordinator can be
//! restarted without losing track of work:
//!
//! | Table             | Contents                                             |
//! |-------------------|------------------------------------------------------|
//! | `features`        | one row per submitted feature and its status         |
//! | `tasks`           | dependency-graph nodes and their status              |
//! | `executions`      | per-launch workspace, ports and free-form metadata   |
//! | `port_slots`      | port pool reservations                               |
//! | `status_messages` | recent per-feature messages read by the breaker      |
//! | `loop_guard`      | attempt history when persistence is enabled          |
//!
//! Task status only changes through [`StoreDb::transition`], a conditional
//! update that lets exactly one caller win a race for the same edge.

pub mod db;
pub mod graph;
pub mod models;

pub use db::{DbHandle, StoreDb};
pub use graph::TaskGraph;
pub use models::*;
