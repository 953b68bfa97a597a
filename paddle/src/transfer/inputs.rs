//! Staging a step's declared inputs.

use super::Transfer;
use crate::definition::{PipelineDefinition, Step};
use crate::errors::TransferError;
use std::path::{Path, PathBuf};
use tracing::info;

impl Transfer {
    /// Fetches every input of `step` into `destination`, one after another.
    ///
    /// Inputs with a `subdir` land in that subdirectory of `destination`.
    /// The first failing input aborts the staging.
    pub async fn fetch_step_inputs(
        &self,
        pipeline: &PipelineDefinition,
        step: &Step,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, TransferError> {
        let mut files = Vec::new();
        for input in &step.inputs {
            let source = input.transfer_target(pipeline.input_bucket(input));
            let target = match &input.subdir {
                Some(subdir) => destination.join(subdir),
                None => destination.to_path_buf(),
            };
            info!(step = %step.name, input = %input.step, source = %source, "Staging input");
            files.extend(self.fetch(&source, &input.keys, &target).await?);
        }
        Ok(files)
    }
}
