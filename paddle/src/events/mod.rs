//! Event sinks for step lifecycle observability.
//!
//! The orchestrator reports every lifecycle transition (step started, pod
//! submitted, container started, step finished) and every container log
//! line to an [`EventSink`]. The default sink logs through `tracing`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the orchestrator.
pub mod names {
    /// A step is about to run.
    pub const STEP_STARTED: &str = "step.started";
    /// A step finished successfully.
    pub const STEP_COMPLETED: &str = "step.completed";
    /// A step failed.
    pub const STEP_FAILED: &str = "step.failed";
    /// A step was skipped by the step filter.
    pub const STEP_SKIPPED: &str = "step.skipped";
    /// A previous pod is being deleted.
    pub const POD_RECONCILING: &str = "pod.reconciling";
    /// A volume claim was created.
    pub const VOLUME_PROVISIONED: &str = "volume.provisioned";
    /// The pod was created.
    pub const POD_SUBMITTED: &str = "pod.submitted";
    /// A container started running.
    pub const CONTAINER_STARTED: &str = "container.started";
    /// A container stopped running.
    pub const CONTAINER_REMOVED: &str = "container.removed";
    /// A container produced a log line.
    pub const CONTAINER_LOG: &str = "container.log";
}
