//! Step orchestration.
//!
//! [`StepRunner`] takes one step from a clean slate to a classified
//! outcome:
//!
//! 1. reconcile: delete any pod with the step's name and wait until it is gone
//! 2. provision a volume claim if the step asks for storage
//! 3. submit the rendered pod
//! 4. track it through the watcher, tailing container logs and enforcing
//!    the start timeout
//! 5. classify the terminal event and clean up
//!
//! [`PipelineRunner`] runs steps in declared order and stops at the first
//! failure.

mod integration_tests;
mod pipeline;
mod step;

pub use pipeline::{PipelineRunner, RunReport, StepReport};
pub use step::{StepOutcome, StepRunner};
