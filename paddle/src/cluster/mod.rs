//! Cluster scheduling capability.
//!
//! The orchestrator and the watcher talk to the cluster only through
//! [`ClusterClient`], so a scripted fake can stand in for a real API
//! server in tests.

#[cfg(feature = "kube")]
mod kubernetes;
mod manifest;

#[cfg(feature = "kube")]
pub use kubernetes::KubeCluster;
pub use manifest::{PodManifest, VolumeClaimManifest};

use crate::errors::ClusterError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Lifecycle phase reported for a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not all containers are running yet.
    #[default]
    Pending,
    /// Bound to a node with at least one container running.
    Running,
    /// All containers exited successfully.
    Succeeded,
    /// All containers exited and at least one failed.
    Failed,
    /// The phase could not be determined.
    Unknown,
}

impl PodPhase {
    /// Parses the phase string used by the cluster API.
    #[must_use]
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// State of a single container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    /// Not started yet.
    Waiting {
        /// Short reason, e.g. `ImagePullBackOff`.
        reason: Option<String>,
        /// Human-readable detail.
        message: Option<String>,
    },
    /// Running.
    Running,
    /// Exited.
    Terminated {
        /// Process exit code.
        exit_code: i32,
        /// Termination message.
        message: Option<String>,
    },
}

impl Default for ContainerState {
    fn default() -> Self {
        Self::Waiting {
            reason: None,
            message: None,
        }
    }
}

/// Status of one container in a pod snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Current state.
    pub state: ContainerState,
}

impl ContainerStatus {
    /// Creates a waiting container status.
    #[must_use]
    pub fn waiting(name: impl Into<String>, reason: Option<&str>) -> Self {
        Self {
            name: name.into(),
            state: ContainerState::Waiting {
                reason: reason.map(ToString::to_string),
                message: None,
            },
        }
    }

    /// Creates a running container status.
    #[must_use]
    pub fn running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ContainerState::Running,
        }
    }

    /// Creates a terminated container status.
    #[must_use]
    pub fn terminated(name: impl Into<String>, exit_code: i32, message: Option<&str>) -> Self {
        Self {
            name: name.into(),
            state: ContainerState::Terminated {
                exit_code,
                message: message.map(ToString::to_string),
            },
        }
    }
}

/// Strongly-typed view of a pod at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSnapshot {
    /// Pod name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Phase.
    pub phase: PodPhase,
    /// Pod-level status message.
    pub message: Option<String>,
    /// Names of the containers declared in the pod spec.
    pub containers: Vec<String>,
    /// Per-container status, as reported.
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodSnapshot {
    /// Creates a pending snapshot with no container status.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Sets the phase.
    #[must_use]
    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Sets the declared containers.
    #[must_use]
    pub fn with_containers<I, S>(mut self, containers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.containers = containers.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a container status.
    #[must_use]
    pub fn with_status(mut self, status: ContainerStatus) -> Self {
        self.container_statuses.push(status);
        self
    }

    /// Returns the first waiting reason reported by any container.
    #[must_use]
    pub fn waiting_reason(&self) -> Option<String> {
        self.container_statuses.iter().find_map(|c| match &c.state {
            ContainerState::Waiting {
                reason: Some(reason),
                message,
            } => Some(match message {
                Some(message) => format!("{reason}: {message}"),
                None => reason.clone(),
            }),
            _ => None,
        })
    }
}

/// A raw change notification for a watched pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPodEvent {
    /// The pod was created.
    Added(PodSnapshot),
    /// The pod changed.
    Modified(PodSnapshot),
    /// The pod was removed.
    Deleted(PodSnapshot),
    /// The API reported a watch error.
    Error(String),
}

/// How a pod is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Let the pod shut down within its grace period.
    #[default]
    Graceful,
    /// Remove immediately, with no grace period.
    Force,
}

/// Stream of raw pod notifications; ends when the subscription drops.
pub type PodEventStream = BoxStream<'static, RawPodEvent>;

/// Stream of container log lines.
pub type LogStream = BoxStream<'static, Result<String, ClusterError>>;

/// Operations the engine needs from the cluster API.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Creates a pod from a decoded manifest.
    async fn create_pod(&self, manifest: &PodManifest) -> Result<PodSnapshot, ClusterError>;

    /// Deletes a pod. A missing pod yields [`ClusterError::NotFound`].
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        policy: DeletePolicy,
    ) -> Result<(), ClusterError>;

    /// Reads a pod's current status.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodSnapshot, ClusterError>;

    /// Subscribes to changes of the pod with exactly this name.
    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodEventStream, ClusterError>;

    /// Creates a persistent volume claim.
    async fn create_volume_claim(&self, manifest: &VolumeClaimManifest) -> Result<(), ClusterError>;

    /// Deletes a persistent volume claim.
    async fn delete_volume_claim(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Follows a container's log output.
    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogStream, ClusterError>;
}
