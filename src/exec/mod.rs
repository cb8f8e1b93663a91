//! Bounded-parallelism command execution.
//!
//! [`shell::ShellExecutor`] supervises one subprocess from spawn to a
//! terminal state; [`engine::ExecutionEngine`] fans a batch out over a
//! capped worker pool and persists every outcome through the store.

pub mod engine;
pub mod shell;

pub use engine::{Dispatch, ExecutionEngine, Tally};
pub use shell::{CommandStatus, ExecutionResult, ShellExecutor};
