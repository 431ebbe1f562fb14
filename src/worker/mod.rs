//! Everything between the coordinator and the external agent process.
//!
//! - [`output`]: signal tags parsed from worker output
//! - [`invoker`]: one agent invocation ([`ProcessInvoker`] spawns the CLI)
//! - [`runner`]: [`TaskRunner`], the idempotent per-task run
//! - [`launcher`]: [`DetachedLauncher`], fire-and-forget launch reporting
//!   completion back on the coordinator's channel

pub mod invoker;
pub mod launcher;
pub mod output;
pub mod runner;

pub use invoker::{AgentInvoker, InvocationOutput, InvocationRequest, ProcessInvoker};
pub use launcher::{DetachedLauncher, WorkerLauncher};
pub use output::{OutputParser, WorkerSignal};
pub use runner::{RunOutcome, TaskRunner, build_prompt};
