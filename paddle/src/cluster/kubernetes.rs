//! Cluster client backed by a Kubernetes API server.

use super::{
    ClusterClient, ContainerState, ContainerStatus, DeletePolicy, LogStream, PodEventStream,
    PodManifest, PodPhase, PodSnapshot, RawPodEvent, VolumeClaimManifest,
};
use crate::errors::ClusterError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{self as core, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use tracing::{debug, warn};

const DEFAULT_NAMESPACE: &str = "default";
/// Server-side lifetime of one watch request, in seconds. The API server
/// rejects values of 295 and above.
const WATCH_TIMEOUT_SECS: u32 = 290;
/// Status code of a watch whose resource version has been compacted away.
const GONE: u16 = 410;
/// Resource version that restarts a watch from the current state.
const ANY_VERSION: &str = "0";

/// [`ClusterClient`] implementation using `kube`.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wraps an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects using the local kubeconfig or in-cluster configuration.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::api(0, e.to_string()))?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

fn map_error(kind: &str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::not_found(kind, name),
        kube::Error::Api(response) if response.code == 403 => {
            ClusterError::forbidden(kind, name, response.message)
        }
        kube::Error::Api(response) => ClusterError::api(response.code, response.message),
        other => ClusterError::api(0, other.to_string()),
    }
}

fn container_status(status: &core::ContainerStatus) -> ContainerStatus {
    let state = status.state.as_ref();
    let state = if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
        ContainerState::Terminated {
            exit_code: terminated.exit_code,
            message: terminated.message.clone(),
        }
    } else if state.and_then(|s| s.running.as_ref()).is_some() {
        ContainerState::Running
    } else {
        let waiting = state.and_then(|s| s.waiting.as_ref());
        ContainerState::Waiting {
            reason: waiting.and_then(|w| w.reason.clone()),
            message: waiting.and_then(|w| w.message.clone()),
        }
    };

    ContainerStatus {
        name: status.name.clone(),
        state,
    }
}

fn snapshot(pod: &Pod) -> PodSnapshot {
    let status = pod.status.as_ref();
    PodSnapshot {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.as_deref())
            .map_or(PodPhase::Unknown, PodPhase::parse),
        message: status.and_then(|s| s.message.clone()),
        containers: pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default(),
        container_statuses: status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| statuses.iter().map(container_status).collect())
            .unwrap_or_default(),
    }
}

/// What to do with one item read from a watch request.
#[derive(Debug, PartialEq)]
enum WatchStep {
    /// Hand the event to the subscriber.
    Emit(RawPodEvent),
    /// Open a new watch request from the cursor's version.
    Resubscribe,
    /// Nothing to report; keep reading.
    Skip,
}

/// Resume point of a pod watch across watch requests.
#[derive(Debug)]
struct WatchCursor {
    version: String,
}

impl Default for WatchCursor {
    fn default() -> Self {
        Self {
            version: ANY_VERSION.to_string(),
        }
    }
}

impl WatchCursor {
    /// Classifies the next item of the current request. `None` is a clean
    /// server-side close, which resumes from the last seen version.
    fn advance(&mut self, next: Option<kube::Result<WatchEvent<Pod>>>) -> WatchStep {
        match next {
            None => WatchStep::Resubscribe,
            Some(Ok(WatchEvent::Added(pod))) => {
                self.observe(&pod);
                WatchStep::Emit(RawPodEvent::Added(snapshot(&pod)))
            }
            Some(Ok(WatchEvent::Modified(pod))) => {
                self.observe(&pod);
                WatchStep::Emit(RawPodEvent::Modified(snapshot(&pod)))
            }
            Some(Ok(WatchEvent::Deleted(pod))) => {
                self.observe(&pod);
                WatchStep::Emit(RawPodEvent::Deleted(snapshot(&pod)))
            }
            Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                self.version = bookmark.metadata.resource_version;
                WatchStep::Skip
            }
            Some(Ok(WatchEvent::Error(e))) if e.code == GONE => {
                self.version = ANY_VERSION.to_string();
                WatchStep::Resubscribe
            }
            Some(Ok(WatchEvent::Error(e))) => WatchStep::Emit(RawPodEvent::Error(e.message)),
            Some(Err(e)) => WatchStep::Emit(RawPodEvent::Error(e.to_string())),
        }
    }

    fn observe(&mut self, pod: &Pod) {
        if let Some(version) = &pod.metadata.resource_version {
            self.version.clone_from(version);
        }
    }
}

/// A pod watch that outlives individual watch requests.
struct PodSubscription {
    api: Api<Pod>,
    params: WatchParams,
    name: String,
    cursor: WatchCursor,
    events: Option<BoxStream<'static, kube::Result<WatchEvent<Pod>>>>,
}

impl PodSubscription {
    /// Yields the next event; ends only when a new request cannot be opened.
    async fn next_event(mut self) -> Option<(RawPodEvent, Self)> {
        loop {
            if self.events.is_none() {
                match self.api.watch(&self.params, &self.cursor.version).await {
                    Ok(events) => self.events = Some(events.boxed()),
                    Err(e) => {
                        warn!(pod = %self.name, error = %e, "Error re-opening pod watch");
                        return None;
                    }
                }
            }
            let next = match self.events.as_mut() {
                Some(events) => events.next().await,
                None => return None,
            };
            match self.cursor.advance(next) {
                WatchStep::Emit(event) => return Some((event, self)),
                WatchStep::Resubscribe => {
                    debug!(pod = %self.name, version = %self.cursor.version, "Re-opening pod watch");
                    self.events = None;
                }
                WatchStep::Skip => {}
            }
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<PodSnapshot, ClusterError> {
        let pod: Pod = serde_json::from_value(manifest.body.clone())
            .map_err(|e| ClusterError::api(422, e.to_string()))?;
        let created = self
            .pods(manifest.namespace_or(DEFAULT_NAMESPACE))
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| map_error("pod", &manifest.name, e))?;
        Ok(snapshot(&created))
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        policy: DeletePolicy,
    ) -> Result<(), ClusterError> {
        let params = match policy {
            DeletePolicy::Graceful => DeleteParams::default(),
            DeletePolicy::Force => DeleteParams {
                grace_period_seconds: Some(0),
                ..DeleteParams::default()
            },
        };
        self.pods(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| map_error("pod", name, e))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodSnapshot, ClusterError> {
        self.pods(namespace)
            .get(name)
            .await
            .map(|pod| snapshot(&pod))
            .map_err(|e| map_error("pod", name, e))
    }

    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodEventStream, ClusterError> {
        let params = WatchParams::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(WATCH_TIMEOUT_SECS);
        let api = self.pods(namespace);
        let events = api
            .watch(&params, ANY_VERSION)
            .await
            .map_err(|e| map_error("pod", name, e))?
            .boxed();

        let subscription = PodSubscription {
            api,
            params,
            name: name.to_string(),
            cursor: WatchCursor::default(),
            events: Some(events),
        };
        Ok(futures::stream::unfold(subscription, PodSubscription::next_event).boxed())
    }

    async fn create_volume_claim(&self, manifest: &VolumeClaimManifest) -> Result<(), ClusterError> {
        let claim: PersistentVolumeClaim = serde_json::from_value(manifest.body.clone())
            .map_err(|e| ClusterError::api(422, e.to_string()))?;
        self.claims(manifest.namespace_or(DEFAULT_NAMESPACE))
            .create(&PostParams::default(), &claim)
            .await
            .map(|_| ())
            .map_err(|e| map_error("persistentvolumeclaim", &manifest.name, e))
    }

    async fn delete_volume_claim(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_error("persistentvolumeclaim", name, e))
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogStream, ClusterError> {
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..LogParams::default()
        };
        let reader = self
            .pods(namespace)
            .log_stream(pod, &params)
            .await
            .map_err(|e| map_error("pod", pod, e))?;

        Ok(reader
            .lines()
            .map(|line| line.map_err(|e| ClusterError::Stream(e.to_string())))
            .boxed())
    }
}
