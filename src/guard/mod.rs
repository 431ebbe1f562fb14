//! Retry bounds outside the remediation loop.
//!
//! - [`LoopGuard`]: per-task attempt counter with a cooldown, consulted
//!   before every launch.
//! - [`CircuitBreaker`]: aborts a whole feature once retry markers dominate
//!   its recent status messages, catching loops that span re-invocations.

mod circuit;
mod loop_guard;

pub use circuit::{CircuitBreaker, CircuitTrip};
pub use loop_guard::{AttemptLedger, Clock, GuardDecision, LoopGuard, MemoryLedger, SqliteLedger};
