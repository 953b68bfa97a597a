//! Running every step of a pipeline in order.

use super::StepRunner;
use crate::cancellation::CancellationToken;
use crate::definition::{PipelineDefinition, PodDefinition, Step};
use crate::errors::{PaddleError, Result};
use crate::events::names;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info};

/// Summary of one step that ran successfully.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    /// Step name.
    pub step: String,
    /// Pod that ran it.
    pub pod: String,
    /// Containers observed running.
    pub containers: Vec<String>,
    /// Wall time from reconciliation to cleanup, in seconds.
    pub duration_secs: f64,
}

/// Summary of a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Pipeline name.
    pub pipeline: String,
    /// Steps that ran, in order.
    pub steps: Vec<StepReport>,
    /// Steps left out by the step filter.
    pub skipped: Vec<String>,
}

/// Runs a pipeline's steps one after another, stopping at the first
/// failure.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    steps: StepRunner,
    cancel_token: Arc<CancellationToken>,
}

impl PipelineRunner {
    /// Creates a runner driving `steps`.
    #[must_use]
    pub fn new(steps: StepRunner) -> Self {
        Self {
            steps,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Sets the token that cancels the run.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel_token: Arc<CancellationToken>) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Returns the token that cancels the run.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Runs `pipeline`.
    ///
    /// On the first error `on_fatal` is called once with the formatted
    /// message and no further step is scheduled. Whether that ends the
    /// process is up to the caller.
    pub async fn run<F>(&self, pipeline: &PipelineDefinition, on_fatal: F) -> Result<RunReport>
    where
        F: FnOnce(String),
    {
        match self.execute(pipeline).await {
            Ok(report) => Ok(report),
            Err(e) => {
                on_fatal(e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(&self, pipeline: &PipelineDefinition) -> Result<RunReport> {
        let config = self.steps.config();
        let events = self.steps.events();
        let mut pipeline = pipeline.clone();
        pipeline.apply_global_env(config.env_branch())?;
        if let Some(bucket) = &config.bucket {
            pipeline.bucket.clone_from(bucket);
        }
        if let Some(only) = &config.step {
            if pipeline.step(only).is_none() {
                return Err(PaddleError::Config(format!(
                    "step {only} not found in pipeline {}",
                    pipeline.pipeline
                )));
            }
        }

        let mut report = RunReport {
            pipeline: pipeline.pipeline.clone(),
            steps: Vec::new(),
            skipped: Vec::new(),
        };

        for step in &pipeline.steps {
            if config.step.as_ref().is_some_and(|only| only != &step.name) {
                info!(step = %step.name, "Skipping step");
                events
                    .emit(names::STEP_SKIPPED, Some(json!({ "step": step.name })))
                    .await;
                report.skipped.push(step.name.clone());
                continue;
            }

            let step = self.prepare(&pipeline, step);
            let definition = PodDefinition::new(&pipeline, &step)?;
            info!(
                pipeline = %pipeline.pipeline,
                step = %step.name,
                version = %step.version,
                branch = %step.branch,
                pod = %definition.pod_name,
                "Running step"
            );
            events
                .emit(
                    names::STEP_STARTED,
                    Some(json!({ "step": step.name, "pod": definition.pod_name })),
                )
                .await;

            let started = Instant::now();
            match self.steps.run_step(&definition, &self.cancel_token).await {
                Ok(outcome) => {
                    let duration_secs = started.elapsed().as_secs_f64();
                    info!(step = %step.name, duration_secs, "Step completed");
                    events
                        .emit(
                            names::STEP_COMPLETED,
                            Some(json!({
                                "step": step.name,
                                "pod": outcome.pod,
                                "duration_secs": duration_secs,
                            })),
                        )
                        .await;
                    report.steps.push(StepReport {
                        step: step.name.clone(),
                        pod: outcome.pod,
                        containers: outcome.containers,
                        duration_secs,
                    });
                }
                Err(e) => {
                    error!(step = %step.name, error = %e, "Step failed");
                    events
                        .emit(
                            names::STEP_FAILED,
                            Some(json!({
                                "step": step.name,
                                "pod": definition.pod_name,
                                "error": e.to_string(),
                            })),
                        )
                        .await;
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Applies the run's image, branch and version overrides to a step.
    fn prepare(&self, pipeline: &PipelineDefinition, step: &Step) -> Step {
        let config = self.steps.config();
        let cascade = pipeline.override_inputs || config.override_inputs;
        let mut step = step.clone();
        if let Some(tag) = &config.image_tag {
            step.override_tag(tag);
        }
        if let Some(branch) = &config.step_branch {
            step.override_branch(branch, cascade);
        }
        if let Some(version) = &config.step_version {
            step.override_version(version, cascade);
        }
        step
    }
}
