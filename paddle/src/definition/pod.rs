//! Per-run pod definitions.

use super::{sanitize_name, PipelineDefinition, Step};
use crate::errors::{PaddleError, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// A secret exposed to the step container as an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodSecret {
    /// Environment variable name.
    pub name: String,
    /// Secret store holding the value.
    pub store: String,
    /// Key inside the store.
    pub key: String,
}

impl PodSecret {
    /// Parses a `NAME:store:key` triple.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(store), Some(key)) if !name.is_empty() => Ok(Self {
                name: name.to_string(),
                store: store.to_string(),
                key: key.to_string(),
            }),
            _ => Err(PaddleError::Manifest(format!(
                "secret '{spec}' must be 'NAME:store:key'"
            ))),
        }
    }
}

/// A plain environment variable for the step container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodEnvVariable {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// Everything needed to render and track one step's pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodDefinition {
    /// Deterministic pod name; also the reconciliation key.
    pub pod_name: String,
    /// Sanitized step name.
    pub step_name: String,
    /// Sanitized step version.
    pub step_version: String,
    /// Sanitized branch name.
    pub branch_name: String,
    /// Target namespace.
    pub namespace: String,
    /// The pipeline bucket.
    pub bucket: String,
    /// Secrets exposed to the main container.
    pub secrets: Vec<PodSecret>,
    /// Extra environment for the main container.
    pub env: Vec<PodEnvVariable>,
    /// Input bucket replacements.
    pub bucket_overrides: BTreeMap<String, String>,
    /// The step being run.
    pub step: Step,
}

impl PodDefinition {
    /// Derives the pod definition of `step` within `pipeline`.
    pub fn new(pipeline: &PipelineDefinition, step: &Step) -> Result<Self> {
        let step_name = sanitize_name(&step.name);
        let step_version = sanitize_name(&step.version);
        let branch_name = sanitize_name(&step.branch);
        let pod_name = format!(
            "{}-{step_version}-{step_name}-{branch_name}",
            sanitize_name(&pipeline.pipeline)
        );

        let secrets = pipeline
            .secrets
            .iter()
            .map(|s| PodSecret::parse(s))
            .collect::<Result<Vec<_>>>()?;
        let env = pipeline
            .env
            .iter()
            .map(|(name, value)| PodEnvVariable {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();

        Ok(Self {
            pod_name,
            step_name,
            step_version,
            branch_name,
            namespace: pipeline.namespace.clone(),
            bucket: pipeline.bucket.clone(),
            secrets,
            env,
            bucket_overrides: pipeline.bucket_overrides.clone(),
            step: step.clone(),
        })
    }

    /// Returns true if the step needs a persistent volume claim.
    #[must_use]
    pub fn needs_volume(&self) -> bool {
        self.step.resources.storage_mb != 0
    }

    /// Returns the name of the step's volume claim.
    #[must_use]
    pub fn volume_claim_name(&self) -> String {
        format!("{}-volume-claim", self.pod_name)
    }

    /// Resolves the bucket an input with an explicit bucket reads from.
    #[must_use]
    pub fn resolve_bucket<'a>(&'a self, bucket: &'a str) -> &'a str {
        self.bucket_overrides
            .get(bucket)
            .map_or(bucket, String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Resources, StepInput};
    use pretty_assertions::assert_eq;

    fn step(storage_mb: u64) -> Step {
        Step {
            name: "Train_Model".to_string(),
            version: "V1".to_string(),
            branch: "feature/foo".to_string(),
            image: "registry/train:latest".to_string(),
            inputs: vec![StepInput {
                step: "prep".to_string(),
                version: "v1".to_string(),
                branch: "master".to_string(),
                path: String::new(),
                bucket: None,
                keys: vec![],
                subdir: None,
            }],
            commands: vec!["python train.py".to_string()],
            resources: Resources {
                cpu: 1,
                memory: "1Gi".to_string(),
                storage_mb,
            },
        }
    }

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition {
            pipeline: "Sample_Pipeline".to_string(),
            bucket: "bucket".to_string(),
            namespace: "ns".to_string(),
            steps: vec![],
            global_env: BTreeMap::new(),
            env: BTreeMap::from([("MODE".to_string(), "fast".to_string())]),
            secrets: vec!["DB_PASSWORD:db-credentials:password".to_string()],
            bucket_overrides: BTreeMap::from([("a".to_string(), "b".to_string())]),
            override_inputs: false,
        }
    }

    #[test]
    fn test_pod_name_is_deterministic() {
        let first = PodDefinition::new(&pipeline(), &step(0)).unwrap();
        let second = PodDefinition::new(&pipeline(), &step(0)).unwrap();

        assert_eq!(first.pod_name, "sample-pipeline-v1-train-model-feature-foo");
        assert_eq!(first.pod_name, second.pod_name);
        assert_eq!(first.namespace, "ns");
        assert_eq!(
            first.secrets,
            vec![PodSecret {
                name: "DB_PASSWORD".to_string(),
                store: "db-credentials".to_string(),
                key: "password".to_string(),
            }]
        );
        assert_eq!(first.env[0].name, "MODE");
    }

    #[test]
    fn test_volume_only_with_storage() {
        let without = PodDefinition::new(&pipeline(), &step(0)).unwrap();
        assert!(!without.needs_volume());

        let with = PodDefinition::new(&pipeline(), &step(512)).unwrap();
        assert!(with.needs_volume());
        assert_eq!(
            with.volume_claim_name(),
            "sample-pipeline-v1-train-model-feature-foo-volume-claim"
        );
    }

    #[test]
    fn test_malformed_secret_is_rejected() {
        let mut pipeline = pipeline();
        pipeline.secrets = vec!["ONLY_NAME".to_string()];
        let err = PodDefinition::new(&pipeline, &step(0)).unwrap_err();
        assert!(err.to_string().contains("ONLY_NAME"));
    }

    #[test]
    fn test_resolve_bucket() {
        let definition = PodDefinition::new(&pipeline(), &step(0)).unwrap();
        assert_eq!(definition.resolve_bucket("a"), "b");
        assert_eq!(definition.resolve_bucket("c"), "c");
    }
}
