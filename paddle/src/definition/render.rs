//! Rendering pod definitions into cluster manifests.

use super::{sanitize_name, PodDefinition, StepInput};
use crate::errors::{PaddleError, Result};
use serde_json::{json, Value};

const DATA_MOUNT: &str = "/data";
const INPUT_PATH: &str = "/data/input";
const OUTPUT_PATH: &str = "/data/output";

/// Produces manifest text for a pod definition.
///
/// The output is opaque to the orchestrator, which only decodes and
/// submits it, so any templating scheme can be plugged in.
pub trait ManifestRenderer: Send + Sync {
    /// Renders the step pod manifest.
    fn render_pod(&self, definition: &PodDefinition) -> Result<String>;

    /// Renders the step's volume claim manifest.
    fn render_volume_claim(&self, definition: &PodDefinition) -> Result<String>;
}

/// Builds manifests as JSON documents.
///
/// The pod runs two containers sharing a data volume: `main` runs the
/// step commands once its inputs are staged, and `paddle` stages inputs
/// before and commits outputs after.
#[derive(Debug, Clone)]
pub struct JsonManifestRenderer {
    sidecar_image: String,
}

impl JsonManifestRenderer {
    /// Creates a renderer whose staging container uses `sidecar_image`.
    #[must_use]
    pub fn new(sidecar_image: impl Into<String>) -> Self {
        Self {
            sidecar_image: sidecar_image.into(),
        }
    }

    fn main_container(definition: &PodDefinition) -> Value {
        let step = &definition.step;
        let commands: String = step
            .commands
            .iter()
            .map(|c| format!("({c}) && "))
            .collect();
        let script = format!(
            "while true; do if [ -e {DATA_MOUNT}/first-step.txt ]; then \
             (({commands}touch {DATA_MOUNT}/main-passed.txt) || \
             (touch {DATA_MOUNT}/main-failed.txt && exit 1)) && \
             touch {DATA_MOUNT}/main.txt; break; fi; sleep 1; done"
        );

        let mut env = vec![
            json!({"name": "INPUT_PATH", "value": INPUT_PATH}),
            json!({"name": "OUTPUT_PATH", "value": OUTPUT_PATH}),
        ];
        env.extend(definition.secrets.iter().map(|s| {
            json!({
                "name": s.name,
                "valueFrom": {"secretKeyRef": {"name": s.store, "key": s.key}},
            })
        }));
        env.extend(
            definition
                .env
                .iter()
                .map(|v| json!({"name": v.name, "value": v.value})),
        );

        json!({
            "name": "main",
            "image": step.image,
            "imagePullPolicy": "Always",
            "command": ["/bin/sh", "-c", script],
            "env": env,
            "volumeMounts": [{"name": "shared-data", "mountPath": DATA_MOUNT}],
            "resources": {
                "limits": {
                    "cpu": step.resources.cpu.to_string(),
                    "memory": step.resources.memory,
                },
            },
        })
    }

    fn fetch_command(definition: &PodDefinition, input: &StepInput) -> String {
        let path = if input.path.is_empty() { "HEAD" } else { &input.path };
        let mut command = format!(
            "paddle data get {}/{} $INPUT_PATH -b {} -p {path}",
            input.step,
            input.version,
            sanitize_name(&input.branch)
        );
        if let Some(bucket) = &input.bucket {
            command.push_str(&format!(" --bucket {}", definition.resolve_bucket(bucket)));
        }
        if !input.keys.is_empty() {
            command.push_str(&format!(" --keys {}", input.keys.join(",")));
        }
        if let Some(subdir) = &input.subdir {
            command.push_str(&format!(" --subdir {subdir}"));
        }
        command
    }

    fn sidecar_container(&self, definition: &PodDefinition) -> Value {
        let fetches: String = definition
            .step
            .inputs
            .iter()
            .map(|input| format!("{} && ", Self::fetch_command(definition, input)))
            .collect();
        let script = format!(
            "mkdir -p $INPUT_PATH $OUTPUT_PATH && {fetches}\
             touch {DATA_MOUNT}/first-step.txt && \
             (while true; do \
             if [ -e {DATA_MOUNT}/main-failed.txt ]; then exit 1; fi; \
             if [ -e {DATA_MOUNT}/main-passed.txt ]; then \
             paddle data commit $OUTPUT_PATH {}/{} -b {}; exit 0; fi; \
             sleep 1; done)",
            definition.step_name, definition.step.version, definition.branch_name
        );

        json!({
            "name": "paddle",
            "image": self.sidecar_image,
            "imagePullPolicy": "Always",
            "command": ["/bin/sh", "-c", script],
            "env": [
                {"name": "BUCKET", "value": definition.bucket},
                {"name": "INPUT_PATH", "value": INPUT_PATH},
                {"name": "OUTPUT_PATH", "value": OUTPUT_PATH},
            ],
            "volumeMounts": [{"name": "shared-data", "mountPath": DATA_MOUNT}],
        })
    }
}

impl ManifestRenderer for JsonManifestRenderer {
    fn render_pod(&self, definition: &PodDefinition) -> Result<String> {
        let volume = if definition.needs_volume() {
            json!({
                "name": "shared-data",
                "persistentVolumeClaim": {"claimName": definition.volume_claim_name()},
            })
        } else {
            json!({"name": "shared-data", "emptyDir": {}})
        };

        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": definition.pod_name,
                "namespace": definition.namespace,
                "labels": {
                    "paddle.step.name": definition.step_name,
                    "paddle.step.branch": definition.branch_name,
                    "paddle.step.version": definition.step_version,
                },
            },
            "spec": {
                "restartPolicy": "Never",
                "volumes": [volume],
                "containers": [
                    Self::main_container(definition),
                    self.sidecar_container(definition),
                ],
            },
        });
        serde_json::to_string_pretty(&manifest).map_err(|e| PaddleError::Manifest(e.to_string()))
    }

    fn render_volume_claim(&self, definition: &PodDefinition) -> Result<String> {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "name": definition.volume_claim_name(),
                "namespace": definition.namespace,
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": {
                    "requests": {"storage": format!("{}Mi", definition.step.resources.storage_mb)},
                },
            },
        });
        serde_json::to_string_pretty(&manifest).map_err(|e| PaddleError::Manifest(e.to_string()))
    }
}
