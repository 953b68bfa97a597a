//! Running a single step as a pod.

use crate::cancellation::{CancellationToken, TaskGroup};
use crate::cluster::{ClusterClient, DeletePolicy, PodManifest, VolumeClaimManifest};
use crate::config::{RunConfig, WatchConfig};
use crate::definition::{ManifestRenderer, PodDefinition};
use crate::errors::{ClusterError, PaddleError, Result, StepError, StepFailure};
use crate::events::{names, EventSink, LoggingEventSink};
use crate::watch::{PodWatcher, WatchEvent, WatchEventKind};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const START_TIMEOUT_REASON: &str = "start timeout";

/// What a successful step observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// The pod that ran the step.
    pub pod: String,
    /// Containers observed running, in start order.
    pub containers: Vec<String>,
}

/// How the tracking loop ended.
enum Terminal {
    Completed,
    Failed(WatchEvent),
    Deleted,
    StartTimeout,
    WatchClosed,
    LogStream(String, ClusterError),
    Cancelled(String),
}

/// Runs one step's pod from reconciliation to its terminal outcome.
#[derive(Clone)]
pub struct StepRunner {
    cluster: Arc<dyn ClusterClient>,
    renderer: Arc<dyn ManifestRenderer>,
    watcher: PodWatcher,
    events: Arc<dyn EventSink>,
    config: RunConfig,
}

impl StepRunner {
    /// Creates a runner that logs its events through `tracing`.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        renderer: Arc<dyn ManifestRenderer>,
        watch: WatchConfig,
        config: RunConfig,
    ) -> Self {
        Self {
            watcher: PodWatcher::new(cluster.clone(), watch),
            cluster,
            renderer,
            events: Arc::new(LoggingEventSink::default()),
            config,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Runs the step described by `definition`.
    ///
    /// Manifests are rendered and decoded before anything touches the
    /// cluster, so a malformed template fails without side effects. Every
    /// task the step spawns has exited by the time this returns.
    pub async fn run_step(
        &self,
        definition: &PodDefinition,
        cancel: &Arc<CancellationToken>,
    ) -> Result<StepOutcome> {
        let mut pod = PodManifest::decode(&self.renderer.render_pod(definition)?)?;
        if pod.namespace.is_none() {
            pod.namespace = Some(definition.namespace.clone());
        }
        let claim = if definition.needs_volume() {
            Some(VolumeClaimManifest::decode(
                &self.renderer.render_volume_claim(definition)?,
            )?)
        } else {
            None
        };

        let namespace = pod.namespace_or(&definition.namespace).to_string();
        self.reconcile(definition, &namespace, &pod.name, cancel)
            .await?;
        if let Some(claim) = &claim {
            self.provision_volume(definition, claim).await?;
        }

        self.cluster.create_pod(&pod).await?;
        info!(step = %definition.step.name, pod = %pod.name, namespace = %namespace, "Pod submitted");
        self.emit(names::POD_SUBMITTED, definition, &pod.name, None)
            .await;

        self.track(definition, &namespace, &pod.name, claim.as_ref(), cancel)
            .await
    }

    /// Deletes any pod named `pod` and waits until the cluster reports it
    /// gone.
    ///
    /// A missing pod is success. Any other delete error aborts at once.
    pub async fn reconcile(
        &self,
        definition: &PodDefinition,
        namespace: &str,
        pod: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.emit(names::POD_RECONCILING, definition, pod, None).await;
        let timeout = self.config.delete_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            match self
                .cluster
                .delete_pod(namespace, pod, DeletePolicy::Graceful)
                .await
            {
                Ok(()) => debug!(pod = %pod, "Waiting for previous pod to be deleted"),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(step_error(
                    definition,
                    pod,
                    StepFailure::ReconcileTimeout {
                        seconds: timeout.as_secs(),
                    },
                ));
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(step_error(
                        definition,
                        pod,
                        StepFailure::Cancelled(cancel.reason().unwrap_or_default()),
                    ));
                }
                () = tokio::time::sleep(self.config.delete_poll_interval()) => {}
            }
        }
    }

    async fn provision_volume(
        &self,
        definition: &PodDefinition,
        claim: &VolumeClaimManifest,
    ) -> Result<()> {
        let namespace = claim.namespace_or(&definition.namespace);
        self.release_volume(namespace, &claim.name).await?;
        self.cluster.create_volume_claim(claim).await?;
        info!(
            claim = %claim.name,
            storage_mb = definition.step.resources.storage_mb,
            "Volume claim created"
        );
        self.events
            .emit(
                names::VOLUME_PROVISIONED,
                Some(json!({
                    "step": definition.step.name,
                    "claim": claim.name,
                    "storage_mb": definition.step.resources.storage_mb,
                })),
            )
            .await;
        Ok(())
    }

    /// Deletes a volume claim, treating "not found" and "forbidden" as
    /// already gone.
    // TODO: revalidate the forbidden case against current API servers; it
    // was observed for missing claims, not documented.
    async fn release_volume(&self, namespace: &str, claim: &str) -> Result<()> {
        match self.cluster.delete_volume_claim(namespace, claim).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_forbidden() => {
                debug!(claim = %claim, error = %e, "No volume claim to delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn track(
        &self,
        definition: &PodDefinition,
        namespace: &str,
        pod: &str,
        claim: Option<&VolumeClaimManifest>,
        cancel: &Arc<CancellationToken>,
    ) -> Result<StepOutcome> {
        let step_token = cancel.child();
        let mut watch = self.watcher.watch(namespace, pod, &step_token).await?;
        let logs = TaskGroup::new(step_token.child());
        let (log_errors, mut log_error_rx) = mpsc::unbounded_channel();
        let start_deadline = tokio::time::sleep(self.config.start_timeout());
        tokio::pin!(start_deadline);
        let mut started: Vec<String> = Vec::new();

        let terminal = loop {
            tokio::select! {
                biased;
                () = step_token.cancelled() => {
                    break Terminal::Cancelled(step_token.reason().unwrap_or_default());
                }
                Some((container, error)) = log_error_rx.recv() => {
                    break Terminal::LogStream(container, error);
                }
                () = &mut start_deadline, if started.is_empty() => {
                    step_token.cancel(START_TIMEOUT_REASON);
                    break Terminal::StartTimeout;
                }
                event = watch.recv() => {
                    let Some(event) = event else {
                        break Terminal::WatchClosed;
                    };
                    match event.kind {
                        WatchEventKind::ContainerStarted => {
                            let container = event.container.unwrap_or_default();
                            info!(pod = %pod, container = %container, "Container started");
                            self.emit(names::CONTAINER_STARTED, definition, pod, Some(container.as_str()))
                                .await;
                            if self.config.tail_logs && !started.contains(&container) {
                                self.tail(&logs, namespace, pod, &container, &log_errors);
                            }
                            started.push(container);
                        }
                        WatchEventKind::ContainerRemoved => {
                            let container = event.container.unwrap_or_default();
                            debug!(pod = %pod, container = %container, "Container removed");
                            self.emit(names::CONTAINER_REMOVED, definition, pod, Some(container.as_str()))
                                .await;
                        }
                        WatchEventKind::PodCompleted => break Terminal::Completed,
                        WatchEventKind::PodFailed => break Terminal::Failed(event),
                        WatchEventKind::PodDeletedExternally => break Terminal::Deleted,
                    }
                }
            }
        };
        watch.stop("step finished").await;

        let result = match terminal {
            Terminal::Completed => {
                let grace = self.config.failure_log_grace();
                if tokio::time::timeout(grace, logs.join()).await.is_err() {
                    debug!(pod = %pod, "Log streams still open after completion");
                }
                logs.shutdown("step finished").await;
                if let Some(claim) = claim {
                    self.release_volume(claim.namespace_or(namespace), &claim.name)
                        .await?;
                }
                self.reconcile(definition, namespace, pod, cancel).await?;
                info!(step = %definition.step.name, pod = %pod, "Pod completed");
                return Ok(StepOutcome {
                    pod: pod.to_string(),
                    containers: started,
                });
            }
            Terminal::Failed(event) => {
                let unseen = event
                    .container
                    .as_ref()
                    .filter(|c| self.config.tail_logs && !started.contains(*c));
                if let Some(container) = unseen {
                    self.tail(&logs, namespace, pod, container, &log_errors);
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(self.config.failure_log_grace()) => {}
                    }
                }
                match event.container {
                    Some(container) => Err(StepError::new(
                        &definition.step.name,
                        pod,
                        StepFailure::ContainerFailed {
                            message: event.message.unwrap_or_default(),
                        },
                    )
                    .with_container(container)),
                    None => {
                        warn!(pod = %pod, message = ?event.message, "Pod failed");
                        Err(StepError::new(&definition.step.name, pod, StepFailure::PodFailed))
                    }
                }
            }
            Terminal::Deleted => Err(StepError::new(
                &definition.step.name,
                pod,
                StepFailure::DeletedExternally,
            )),
            Terminal::StartTimeout => {
                let detail = match self.cluster.get_pod(namespace, pod).await {
                    Ok(snapshot) => snapshot.waiting_reason(),
                    Err(e) => {
                        warn!(pod = %pod, error = %e, "Error reading pod status");
                        None
                    }
                };
                match self
                    .cluster
                    .delete_pod(namespace, pod, DeletePolicy::Force)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(pod = %pod, error = %e, "Error force-deleting pod"),
                }
                Err(StepError::new(
                    &definition.step.name,
                    pod,
                    StepFailure::StartTimeout { detail },
                ))
            }
            Terminal::WatchClosed => Err(StepError::new(
                &definition.step.name,
                pod,
                StepFailure::WatchClosed,
            )),
            Terminal::LogStream(container, error) => Err(StepError::new(
                &definition.step.name,
                pod,
                StepFailure::LogStream(error.to_string()),
            )
            .with_container(container)),
            Terminal::Cancelled(reason) => Err(StepError::new(
                &definition.step.name,
                pod,
                StepFailure::Cancelled(reason),
            )),
        };
        logs.shutdown("step finished").await;
        result.map_err(PaddleError::from)
    }

    /// Follows a container's logs until the stream ends or the group stops.
    fn tail(
        &self,
        logs: &TaskGroup,
        namespace: &str,
        pod: &str,
        container: &str,
        errors: &mpsc::UnboundedSender<(String, ClusterError)>,
    ) {
        let cluster = self.cluster.clone();
        let events = self.events.clone();
        let errors = errors.clone();
        let (namespace, pod, container) =
            (namespace.to_string(), pod.to_string(), container.to_string());

        logs.spawn(format!("logs-{container}"), move |stop| async move {
            let mut stream = match cluster.stream_logs(&namespace, &pod, &container).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = errors.send((container, e));
                    return;
                }
            };
            loop {
                let line = tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    line = stream.next() => line,
                };
                match line {
                    Some(Ok(line)) => {
                        info!(pod = %pod, container = %container, "{line}");
                        events.try_emit(
                            names::CONTAINER_LOG,
                            Some(json!({ "pod": pod, "container": container, "line": line })),
                        );
                    }
                    Some(Err(e)) => {
                        warn!(pod = %pod, container = %container, error = %e, "Log stream broke");
                        break;
                    }
                    None => break,
                }
            }
        });
    }

    async fn emit(
        &self,
        event_type: &str,
        definition: &PodDefinition,
        pod: &str,
        container: Option<&str>,
    ) {
        let mut data = json!({ "step": definition.step.name, "pod": pod });
        if let Some(container) = container {
            data["container"] = json!(container);
        }
        self.events.emit(event_type, Some(data)).await;
    }

}

fn step_error(definition: &PodDefinition, pod: &str, failure: StepFailure) -> PaddleError {
    StepError::new(&definition.step.name, pod, failure).into()
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("watcher", &self.watcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
