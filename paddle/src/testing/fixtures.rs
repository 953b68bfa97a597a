//! Pipeline fixtures.

use crate::definition::{PipelineDefinition, Resources, Step};
use std::collections::BTreeMap;

/// Creates a step with one `echo` command and no storage.
#[must_use]
pub fn step(name: &str) -> Step {
    step_with_storage(name, 0)
}

/// Creates a step requesting `storage_mb` of volume storage.
#[must_use]
pub fn step_with_storage(name: &str, storage_mb: u64) -> Step {
    Step {
        name: name.to_string(),
        version: "v1".to_string(),
        branch: "master".to_string(),
        image: format!("registry/{name}:latest"),
        inputs: Vec::new(),
        commands: vec![format!("echo {name}")],
        resources: Resources {
            cpu: 1,
            memory: "512Mi".to_string(),
            storage_mb,
        },
    }
}

/// Creates a pipeline named `test` in namespace `jobs` with the given steps.
#[must_use]
pub fn pipeline(steps: Vec<Step>) -> PipelineDefinition {
    PipelineDefinition {
        pipeline: "test".to_string(),
        bucket: "bucket".to_string(),
        namespace: "jobs".to_string(),
        steps,
        global_env: BTreeMap::new(),
        env: BTreeMap::new(),
        secrets: Vec::new(),
        bucket_overrides: BTreeMap::new(),
        override_inputs: false,
    }
}
