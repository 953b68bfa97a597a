//! Decoding rendered manifests.

use crate::errors::{PaddleError, Result};
use serde_json::Value;

fn decode(text: &str, expected_kind: &str) -> Result<(String, Option<String>, Value)> {
    let body: Value = serde_yaml::from_str(text)?;
    if !body.is_object() {
        return Err(PaddleError::Manifest(format!(
            "{expected_kind} manifest must be a mapping"
        )));
    }
    if let Some(kind) = body.get("kind").and_then(Value::as_str) {
        if kind != expected_kind {
            return Err(PaddleError::Manifest(format!(
                "expected kind {expected_kind}, got {kind}"
            )));
        }
    }

    let metadata = body.get("metadata");
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PaddleError::Manifest(format!("{expected_kind} manifest has no metadata.name")))?
        .to_string();
    let namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .map(ToString::to_string);

    Ok((name, namespace, body))
}

/// A decoded pod manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct PodManifest {
    /// Pod name from `metadata.name`.
    pub name: String,
    /// Namespace from `metadata.namespace`, if set.
    pub namespace: Option<String>,
    /// The full manifest.
    pub body: Value,
}

impl PodManifest {
    /// Decodes a YAML or JSON pod manifest.
    pub fn decode(text: &str) -> Result<Self> {
        let (name, namespace, body) = decode(text, "Pod")?;
        Ok(Self {
            name,
            namespace,
            body,
        })
    }

    /// Returns the names of the containers in the pod spec.
    #[must_use]
    pub fn containers(&self) -> Vec<String> {
        self.body
            .pointer("/spec/containers")
            .and_then(Value::as_array)
            .map(|containers| {
                containers
                    .iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the namespace, falling back to `default`.
    #[must_use]
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// A decoded persistent volume claim manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeClaimManifest {
    /// Claim name from `metadata.name`.
    pub name: String,
    /// Namespace from `metadata.namespace`, if set.
    pub namespace: Option<String>,
    /// The full manifest.
    pub body: Value,
}

impl VolumeClaimManifest {
    /// Decodes a YAML or JSON volume claim manifest.
    pub fn decode(text: &str) -> Result<Self> {
        let (name, namespace, body) = decode(text, "PersistentVolumeClaim")?;
        Ok(Self {
            name,
            namespace,
            body,
        })
    }

    /// Returns the namespace, falling back to `default`.
    #[must_use]
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}
