//! Scripted in-memory cluster.

use crate::cluster::{
    ClusterClient, DeletePolicy, LogStream, PodEventStream, PodManifest, PodSnapshot, RawPodEvent,
    VolumeClaimManifest,
};
use crate::errors::ClusterError;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A call made against a [`FakeCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    /// `create_pod(name)`
    CreatePod(String),
    /// `delete_pod(name, policy)`
    DeletePod(String, DeletePolicy),
    /// `get_pod(name)`
    GetPod(String),
    /// `watch_pod(name)`
    WatchPod(String),
    /// `create_volume_claim(name)`
    CreateVolumeClaim(String),
    /// `delete_volume_claim(name)`
    DeleteVolumeClaim(String),
    /// `stream_logs(pod, container)`
    StreamLogs(String, String),
}

#[derive(Default)]
struct State {
    pods: HashMap<String, PodSnapshot>,
    claims: HashSet<String>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<RawPodEvent>>>,
    scripts: HashMap<String, Vec<(Duration, RawPodEvent)>>,
    logs: HashMap<String, Vec<String>>,
    failing_logs: HashSet<String>,
    delete_lag: HashMap<String, usize>,
    delete_error: Option<ClusterError>,
    claim_delete_error: Option<ClusterError>,
    calls: Vec<ClusterCall>,
}

impl State {
    fn apply(&mut self, name: &str, event: RawPodEvent) {
        match &event {
            RawPodEvent::Added(pod) | RawPodEvent::Modified(pod) => {
                self.pods.insert(name.to_string(), pod.clone());
            }
            RawPodEvent::Deleted(_) => {
                self.pods.remove(name);
            }
            RawPodEvent::Error(_) => {}
        }
        if let Some(subscribers) = self.subscribers.get_mut(name) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// An in-memory cluster whose pods follow scripts.
///
/// Pods only change when a test pushes an event or when a script attached
/// with [`FakeCluster::script`] plays after the pod is created. Every call
/// is recorded.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a pod without notifying watchers.
    pub fn insert_pod(&self, pod: PodSnapshot) {
        self.state.lock().pods.insert(pod.name.clone(), pod);
    }

    /// Returns a pod's current snapshot.
    #[must_use]
    pub fn pod(&self, name: &str) -> Option<PodSnapshot> {
        self.state.lock().pods.get(name).cloned()
    }

    /// Stores a volume claim.
    pub fn insert_claim(&self, name: &str) {
        self.state.lock().claims.insert(name.to_string());
    }

    /// Returns true if the claim exists.
    #[must_use]
    pub fn has_claim(&self, name: &str) -> bool {
        self.state.lock().claims.contains(name)
    }

    /// Applies an event to the stored pod and delivers it to watchers.
    pub fn push_event(&self, name: &str, event: RawPodEvent) {
        self.state.lock().apply(name, event);
    }

    /// Ends every subscription for the pod.
    pub fn close_watch(&self, name: &str) {
        self.state.lock().subscribers.remove(name);
    }

    /// Plays `events` after the pod is created, each after its delay.
    pub fn script(&self, name: &str, events: Vec<(Duration, RawPodEvent)>) {
        self.state.lock().scripts.insert(name.to_string(), events);
    }

    /// Sets the log lines a container produces.
    pub fn set_logs<I, S>(&self, container: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .logs
            .insert(container.to_string(), lines.into_iter().map(Into::into).collect());
    }

    /// Makes opening the container's log stream fail.
    pub fn fail_logs(&self, container: &str) {
        self.state.lock().failing_logs.insert(container.to_string());
    }

    /// Keeps the pod around for `deletes` successful delete calls.
    pub fn set_delete_lag(&self, name: &str, deletes: usize) {
        self.state.lock().delete_lag.insert(name.to_string(), deletes);
    }

    /// Makes every pod delete fail with `error`.
    pub fn fail_deletes(&self, error: ClusterError) {
        self.state.lock().delete_error = Some(error);
    }

    /// Makes every claim delete fail with `error`.
    pub fn fail_claim_deletes(&self, error: ClusterError) {
        self.state.lock().claim_delete_error = Some(error);
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&ClusterCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: ClusterCall) {
        self.state.lock().calls.push(call);
    }
}

impl std::fmt::Debug for FakeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeCluster")
            .field("pods", &state.pods.keys().collect::<Vec<_>>())
            .field("calls", &state.calls.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<PodSnapshot, ClusterError> {
        self.record(ClusterCall::CreatePod(manifest.name.clone()));
        let snapshot = PodSnapshot::new(manifest.namespace_or("default"), manifest.name.clone())
            .with_containers(manifest.containers());

        let script = {
            let mut state = self.state.lock();
            if state.pods.contains_key(&manifest.name) {
                return Err(ClusterError::api(409, format!("pod {} already exists", manifest.name)));
            }
            state.pods.insert(manifest.name.clone(), snapshot.clone());
            state.scripts.remove(&manifest.name)
        };

        if let Some(events) = script {
            let state = self.state.clone();
            let name = manifest.name.clone();
            tokio::spawn(async move {
                for (delay, event) in events {
                    tokio::time::sleep(delay).await;
                    state.lock().apply(&name, event);
                }
            });
        }
        Ok(snapshot)
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        name: &str,
        policy: DeletePolicy,
    ) -> Result<(), ClusterError> {
        self.record(ClusterCall::DeletePod(name.to_string(), policy));
        let mut state = self.state.lock();
        if let Some(error) = &state.delete_error {
            return Err(error.clone());
        }
        let Some(pod) = state.pods.get(name).cloned() else {
            return Err(ClusterError::not_found("pod", name));
        };
        if policy == DeletePolicy::Graceful {
            if let Some(lag) = state.delete_lag.get_mut(name) {
                if *lag > 0 {
                    *lag -= 1;
                    return Ok(());
                }
            }
        }
        state.apply(name, RawPodEvent::Deleted(pod));
        Ok(())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<PodSnapshot, ClusterError> {
        self.record(ClusterCall::GetPod(name.to_string()));
        self.pod(name)
            .ok_or_else(|| ClusterError::not_found("pod", name))
    }

    async fn watch_pod(&self, _namespace: &str, name: &str) -> Result<PodEventStream, ClusterError> {
        self.record(ClusterCall::WatchPod(name.to_string()));
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(name.to_string())
            .or_default()
            .push(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn create_volume_claim(&self, manifest: &VolumeClaimManifest) -> Result<(), ClusterError> {
        self.record(ClusterCall::CreateVolumeClaim(manifest.name.clone()));
        if self.state.lock().claims.insert(manifest.name.clone()) {
            Ok(())
        } else {
            Err(ClusterError::api(409, format!("claim {} already exists", manifest.name)))
        }
    }

    async fn delete_volume_claim(&self, _namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.record(ClusterCall::DeleteVolumeClaim(name.to_string()));
        let mut state = self.state.lock();
        if let Some(error) = &state.claim_delete_error {
            return Err(error.clone());
        }
        if state.claims.remove(name) {
            Ok(())
        } else {
            Err(ClusterError::not_found("persistentvolumeclaim", name))
        }
    }

    async fn stream_logs(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogStream, ClusterError> {
        self.record(ClusterCall::StreamLogs(pod.to_string(), container.to_string()));
        let state = self.state.lock();
        if state.failing_logs.contains(container) {
            return Err(ClusterError::Stream(format!(
                "cannot open logs for {pod}/{container}"
            )));
        }
        let lines = state.logs.get(container).cloned().unwrap_or_default();
        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}
