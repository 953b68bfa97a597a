//! Fixed-text manifest renderer.

use crate::definition::{ManifestRenderer, PodDefinition};
use crate::errors::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Renders the same pod manifest for every definition, with the pod name
/// substituted for `{name}` and the namespace for `{namespace}`.
///
/// Every pod definition it renders is kept for inspection.
#[derive(Debug, Clone)]
pub struct StaticRenderer {
    pod: String,
    volume_claim: String,
    rendered: Arc<Mutex<Vec<PodDefinition>>>,
}

impl Default for StaticRenderer {
    fn default() -> Self {
        Self::new(
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: \"{name}\"\n  namespace: {namespace}\n\
             spec:\n  restartPolicy: Never\n  containers:\n    - name: main\n      image: busybox\n",
        )
    }
}

impl StaticRenderer {
    /// Creates a renderer from a pod manifest template.
    #[must_use]
    pub fn new(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            volume_claim: "kind: PersistentVolumeClaim\nmetadata:\n  name: \"{claim}\"\n  namespace: {namespace}\n"
                .to_string(),
            rendered: Arc::default(),
        }
    }

    /// Returns the pod definitions rendered so far, in order.
    #[must_use]
    pub fn rendered(&self) -> Vec<PodDefinition> {
        self.rendered.lock().clone()
    }

    fn fill(template: &str, definition: &PodDefinition) -> String {
        template
            .replace("{name}", &definition.pod_name)
            .replace("{namespace}", &definition.namespace)
            .replace("{claim}", &definition.volume_claim_name())
    }
}

impl ManifestRenderer for StaticRenderer {
    fn render_pod(&self, definition: &PodDefinition) -> Result<String> {
        self.rendered.lock().push(definition.clone());
        Ok(Self::fill(&self.pod, definition))
    }

    fn render_volume_claim(&self, definition: &PodDefinition) -> Result<String> {
        Ok(Self::fill(&self.volume_claim, definition))
    }
}
