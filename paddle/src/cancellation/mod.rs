//! Structured cancellation for step execution.
//!
//! This module provides:
//! - CancellationToken, the single per-step cancellation signal
//! - TaskGroup for spawning the tasks a step owns and joining them on exit

mod task_group;
mod token;

pub use task_group::TaskGroup;
pub use token::CancellationToken;
