//! Pipeline definitions.
//!
//! A pipeline is an ordered list of steps. Each step runs one container
//! image against the outputs of earlier steps, addressed by step name,
//! version and branch inside a bucket.

mod pod;
mod render;

pub use pod::{PodDefinition, PodEnvVariable, PodSecret};
pub use render::{JsonManifestRenderer, ManifestRenderer};

use crate::errors::{PaddleError, Result};
use crate::transfer::{TransferTarget, HEAD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Global environment key mapping a source bucket to its replacement.
const REPLACE_BUCKETS: &str = "replace_buckets";
/// Global environment key enabling input overrides.
const OVERRIDE_INPUTS: &str = "override_inputs";
/// Global environment key replacing the pipeline bucket.
const BUCKET_NAME: &str = "bucket_name";
/// Branch entry in a global environment mapping that applies to any branch.
const ANY_BRANCH: &str = "other";

/// Lower-cases a name and replaces `_` and `/` with `-`.
///
/// ```
/// assert_eq!(paddle::definition::sanitize_name("My_Step/Name"), "my-step-name");
/// ```
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '/'], "-")
}

/// A pipeline: a named, ordered list of steps sharing a bucket and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// The pipeline name.
    pub pipeline: String,
    /// Default bucket for step inputs and outputs.
    pub bucket: String,
    /// Cluster namespace the step pods run in.
    pub namespace: String,
    /// Steps, in execution order.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Per-branch environment: variable name to `{branch: value}`.
    #[serde(default)]
    pub global_env: BTreeMap<String, BTreeMap<String, String>>,
    /// Environment passed to every step.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Secrets as `NAME:store:key` triples.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Input bucket replacements.
    #[serde(default)]
    pub bucket_overrides: BTreeMap<String, String>,
    /// Whether branch and version overrides cascade onto inputs.
    #[serde(default)]
    pub override_inputs: bool,
}

impl PipelineDefinition {
    /// Parses a pipeline from YAML.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Loads a pipeline from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Applies the `global_env` entries matching `branch`.
    ///
    /// An entry keyed by the branch itself wins; otherwise an `other`
    /// entry applies. `replace_buckets` values (`from:to`) become bucket
    /// overrides, `override_inputs` toggles input cascading, `bucket_name`
    /// replaces the pipeline bucket and anything else is added to the step
    /// environment.
    pub fn apply_global_env(&mut self, branch: &str) -> Result<()> {
        let selected: Vec<(String, String)> = self
            .global_env
            .iter()
            .filter_map(|(name, by_branch)| {
                by_branch
                    .get(branch)
                    .or_else(|| by_branch.get(ANY_BRANCH))
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();

        for (name, value) in selected {
            match name.as_str() {
                REPLACE_BUCKETS => {
                    let (from, to) = value.split_once(':').ok_or_else(|| {
                        PaddleError::Manifest(format!(
                            "{REPLACE_BUCKETS} entry '{value}' must be 'from:to'"
                        ))
                    })?;
                    self.bucket_overrides.insert(from.to_string(), to.to_string());
                }
                OVERRIDE_INPUTS => self.override_inputs = value == "true",
                BUCKET_NAME => self.bucket = value,
                _ => {
                    self.env.insert(name, value);
                }
            }
        }
        Ok(())
    }

    /// Returns the step with the given name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Resolves the bucket an input reads from.
    #[must_use]
    pub fn input_bucket(&self, input: &StepInput) -> String {
        match &input.bucket {
            Some(bucket) => self
                .bucket_overrides
                .get(bucket)
                .unwrap_or(bucket)
                .clone(),
            None => self.bucket.clone(),
        }
    }
}

/// Resource requests for a step's main container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU limit, in cores.
    #[serde(default)]
    pub cpu: u32,
    /// Memory limit, in cluster notation (e.g. `2Gi`).
    #[serde(default)]
    pub memory: String,
    /// Ephemeral storage in MiB; zero means no volume claim.
    #[serde(default, rename = "storage-mb")]
    pub storage_mb: u64,
}

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step name.
    #[serde(rename = "step")]
    pub name: String,
    /// Step version.
    pub version: String,
    /// Branch the step writes to.
    pub branch: String,
    /// Container image, `repository[:tag]`.
    pub image: String,
    /// Data the step reads.
    #[serde(default)]
    pub inputs: Vec<StepInput>,
    /// Shell commands run in order.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Resource requests.
    #[serde(default)]
    pub resources: Resources,
}

impl Step {
    /// Replaces the image tag with the sanitized `tag`. Empty tags are ignored.
    pub fn override_tag(&mut self, tag: &str) {
        if tag.is_empty() {
            return;
        }
        let repository = self.image.split(':').next().unwrap_or_default();
        self.image = format!("{repository}:{}", sanitize_name(tag));
    }

    /// Replaces the version, optionally on inputs too.
    ///
    /// Inputs with an explicit bucket read another pipeline's output and are
    /// never redirected.
    pub fn override_version(&mut self, version: &str, override_inputs: bool) {
        if version.is_empty() {
            return;
        }
        self.version = version.to_string();
        if override_inputs {
            for input in self.inputs.iter_mut().filter(|i| i.bucket.is_none()) {
                input.version = version.to_string();
            }
        }
    }

    /// Replaces the branch, optionally on inputs too.
    ///
    /// Inputs with an explicit bucket are left untouched.
    pub fn override_branch(&mut self, branch: &str, override_inputs: bool) {
        if branch.is_empty() {
            return;
        }
        self.branch = branch.to_string();
        if override_inputs {
            for input in self.inputs.iter_mut().filter(|i| i.bucket.is_none()) {
                input.branch = branch.to_string();
            }
        }
    }

    /// Returns the commit destination of this step's outputs.
    #[must_use]
    pub fn output_target(&self, bucket: &str) -> TransferTarget {
        TransferTarget::new(
            bucket,
            format!(
                "{}/{}/{}",
                sanitize_name(&self.name),
                self.version,
                sanitize_name(&self.branch)
            ),
        )
    }
}

/// Data a step reads from an earlier step's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    /// The producing step.
    pub step: String,
    /// The producing step's version.
    pub version: String,
    /// The producing step's branch.
    pub branch: String,
    /// Snapshot path below the branch; `HEAD` when empty.
    #[serde(default)]
    pub path: String,
    /// Bucket of a foreign pipeline, if not the pipeline's own.
    #[serde(default)]
    pub bucket: Option<String>,
    /// Explicit keys to fetch; everything when empty.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Subdirectory of the input directory to fetch into.
    #[serde(default)]
    pub subdir: Option<String>,
}

impl StepInput {
    /// Returns where this input is read from.
    #[must_use]
    pub fn transfer_target(&self, bucket: impl Into<String>) -> TransferTarget {
        let path = if self.path.is_empty() { HEAD } else { &self.path };
        TransferTarget::new(
            bucket,
            format!(
                "{}/{}/{}/{path}",
                self.step,
                self.version,
                sanitize_name(&self.branch)
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
pipeline: Sample_Pipeline
bucket: canoe-sample
namespace: modeltraining
global_env:
  replace_buckets:
    master: "shared-bucket:shared-bucket-prod"
  override_inputs:
    other: "true"
  FEATURE_FLAG:
    master: "on"
    feature/x: "off"
steps:
  - step: step1
    version: v1
    branch: master
    image: "registry/step1:latest"
    commands:
      - "echo hello"
    resources:
      cpu: 2
      memory: 2Gi
      storage-mb: 1024
  - step: step2
    version: v1
    branch: master
    image: "registry/step2"
    inputs:
      - step: step1
        version: v1
        branch: master
        path: HEAD
      - step: external
        version: v3
        branch: Feature/Big_One
        bucket: shared-bucket
        keys: [model.bin]
        subdir: external
"#;

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition::from_yaml_str(PIPELINE).unwrap()
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My_Step/Name"), "my-step-name");
        assert_eq!(sanitize_name("already-fine"), "already-fine");
        assert_eq!(sanitize_name(&sanitize_name("A_b")), sanitize_name("A_b"));
    }

    #[test]
    fn test_parse_preserves_step_order() {
        let pipeline = pipeline();
        let names: Vec<_> = pipeline.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["step1", "step2"]);
        assert_eq!(pipeline.steps[0].resources.storage_mb, 1024);
        assert_eq!(pipeline.steps[1].resources, Resources::default());
        assert_eq!(pipeline.steps[1].inputs[1].keys, vec!["model.bin".to_string()]);
    }

    #[test]
    fn test_malformed_yaml_is_manifest_error() {
        let err = PipelineDefinition::from_yaml_str("pipeline: [").unwrap_err();
        assert!(matches!(err, PaddleError::Manifest(_)));
    }

    #[test]
    fn test_global_env_for_branch() {
        let mut pipeline = pipeline();
        pipeline.apply_global_env("master").unwrap();

        assert!(pipeline.override_inputs);
        assert_eq!(
            pipeline.bucket_overrides.get("shared-bucket").map(String::as_str),
            Some("shared-bucket-prod")
        );
        assert_eq!(pipeline.env.get("FEATURE_FLAG").map(String::as_str), Some("on"));

        let mut other = self::pipeline();
        other.apply_global_env("feature/x").unwrap();
        assert!(other.bucket_overrides.is_empty());
        assert_eq!(other.env.get("FEATURE_FLAG").map(String::as_str), Some("off"));
    }

    #[test]
    fn test_global_env_branch_entry_beats_other() {
        let mut pipeline = pipeline();
        pipeline.global_env.insert(
            "bucket_name".to_string(),
            BTreeMap::from([
                ("master".to_string(), "prod".to_string()),
                ("other".to_string(), "dev".to_string()),
            ]),
        );

        let mut on_master = pipeline.clone();
        on_master.apply_global_env("master").unwrap();
        assert_eq!(on_master.bucket, "prod");

        pipeline.apply_global_env("feature/x").unwrap();
        assert_eq!(pipeline.bucket, "dev");
    }

    #[test]
    fn test_override_tag() {
        let mut step = pipeline().steps[0].clone();
        step.override_tag("Feature/New_Thing");
        assert_eq!(step.image, "registry/step1:feature-new-thing");

        let mut untagged = pipeline().steps[1].clone();
        untagged.override_tag("v2");
        assert_eq!(untagged.image, "registry/step2:v2");

        untagged.override_tag("");
        assert_eq!(untagged.image, "registry/step2:v2");
    }

    #[test]
    fn test_overrides_cascade_only_onto_own_bucket_inputs() {
        let mut step = pipeline().steps[1].clone();
        step.override_branch("experiment", true);
        step.override_version("v9", true);

        assert_eq!(step.branch, "experiment");
        assert_eq!(step.version, "v9");
        assert_eq!(step.inputs[0].branch, "experiment");
        assert_eq!(step.inputs[0].version, "v9");
        assert_eq!(step.inputs[1].branch, "Feature/Big_One");
        assert_eq!(step.inputs[1].version, "v3");
    }

    #[test]
    fn test_overrides_without_cascade() {
        let mut step = pipeline().steps[1].clone();
        step.override_branch("experiment", false);
        step.override_version("", true);

        assert_eq!(step.branch, "experiment");
        assert_eq!(step.version, "v1");
        assert_eq!(step.inputs[0].branch, "master");
    }

    #[test]
    fn test_input_and_output_targets() {
        let mut pipeline = pipeline();
        pipeline.apply_global_env("master").unwrap();
        let step = &pipeline.steps[1];

        let own = &step.inputs[0];
        assert_eq!(
            own.transfer_target(pipeline.input_bucket(own)),
            TransferTarget::new("canoe-sample", "step1/v1/master/HEAD")
        );

        let foreign = &step.inputs[1];
        assert_eq!(
            foreign.transfer_target(pipeline.input_bucket(foreign)),
            TransferTarget::new("shared-bucket-prod", "external/v3/feature-big-one/HEAD")
        );

        assert_eq!(
            step.output_target(&pipeline.bucket),
            TransferTarget::new("canoe-sample", "step2/v1/master")
        );
    }
}
