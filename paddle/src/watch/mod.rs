//! Pod event watcher.
//!
//! Turns the cluster's change notifications for one pod into a small set
//! of lifecycle events. Two producers feed a single translation task:
//!
//! - the push subscription returned by [`ClusterClient::watch_pod`]
//! - a status poll every [`WatchConfig::poll_interval`], because push
//!   subscriptions can stall silently
//!
//! The translation task alone owns the per-container state, so both
//! sources are serialized through it.

mod translate;

pub use translate::PodEventTranslator;

use crate::cancellation::{CancellationToken, TaskGroup};
use crate::cluster::{ClusterClient, PodSnapshot, RawPodEvent};
use crate::config::WatchConfig;
use crate::errors::ClusterError;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WatchEventKind {
    /// A container was observed running for the first time.
    ContainerStarted,
    /// A previously started container terminated.
    ContainerRemoved,
    /// The pod was deleted by someone else.
    PodDeletedExternally,
    /// The pod succeeded.
    PodCompleted,
    /// The pod, or one of its containers, failed.
    PodFailed,
}

impl WatchEventKind {
    /// Returns true for events that end the watch.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::PodDeletedExternally | Self::PodCompleted | Self::PodFailed
        )
    }
}

/// A lifecycle event for a watched pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: WatchEventKind,
    /// The pod as last observed.
    pub pod: PodSnapshot,
    /// The container concerned, if any.
    pub container: Option<String>,
    /// Diagnostic message, if any.
    pub message: Option<String>,
}

impl WatchEvent {
    /// Creates an event without container attribution.
    #[must_use]
    pub fn new(kind: WatchEventKind, pod: PodSnapshot) -> Self {
        Self {
            kind,
            pod,
            container: None,
            message: None,
        }
    }

    /// Attributes the event to a container.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// Input to the translation task.
enum Notification {
    Push(RawPodEvent),
    PushClosed,
    Poll(PodSnapshot),
}

/// A running watch.
///
/// Events arrive through [`PodWatch::recv`]; `None` means the watch has
/// closed, either after a terminal event, because the subscription ended,
/// or because it was cancelled.
#[derive(Debug)]
pub struct PodWatch {
    events: mpsc::Receiver<WatchEvent>,
    tasks: TaskGroup,
}

impl PodWatch {
    /// Receives the next event.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Returns the token that stops this watch.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        self.tasks.cancel_token()
    }

    /// Stops every watch task and waits for them to exit.
    pub async fn stop(mut self, reason: &str) {
        self.events.close();
        self.tasks.shutdown(reason).await;
    }
}

/// Starts pod watches.
#[derive(Clone)]
pub struct PodWatcher {
    cluster: Arc<dyn ClusterClient>,
    config: WatchConfig,
}

impl PodWatcher {
    /// Creates a watcher over `cluster`.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, config: WatchConfig) -> Self {
        Self { cluster, config }
    }

    /// Watches the pod `namespace/name` until a terminal event, the end of
    /// the subscription, or cancellation of `cancel`.
    pub async fn watch(
        &self,
        namespace: &str,
        name: &str,
        cancel: &Arc<CancellationToken>,
    ) -> Result<PodWatch, ClusterError> {
        let subscription = self.cluster.watch_pod(namespace, name).await?;
        let tasks = TaskGroup::new(cancel.child());
        let capacity = self.config.channel_capacity.max(1);
        let (raw_tx, mut raw_rx) = mpsc::channel::<Notification>(capacity);
        let (out_tx, out_rx) = mpsc::channel::<WatchEvent>(capacity);

        let push_tx = raw_tx.clone();
        tasks.spawn(format!("watch-push-{name}"), move |stop| async move {
            let mut subscription = subscription;
            loop {
                let next = tokio::select! {
                    () = stop.cancelled() => break,
                    next = subscription.next() => next,
                };
                let notification = match next {
                    Some(event) => Notification::Push(event),
                    None => Notification::PushClosed,
                };
                let closed = matches!(notification, Notification::PushClosed);
                if push_tx.send(notification).await.is_err() || closed {
                    break;
                }
            }
        });

        let cluster = self.cluster.clone();
        let interval = self.config.poll_interval();
        let (poll_namespace, poll_name) = (namespace.to_string(), name.to_string());
        tasks.spawn(format!("watch-poll-{name}"), move |stop| async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                match cluster.get_pod(&poll_namespace, &poll_name).await {
                    Ok(pod) => {
                        if raw_tx.send(Notification::Poll(pod)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(pod = %poll_name, error = %e, "Error polling pod status"),
                }
            }
        });

        let pod_name = name.to_string();
        tasks.spawn(format!("watch-translate-{name}"), move |stop| async move {
            let mut translator = PodEventTranslator::new();
            'receive: loop {
                let notification = tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    notification = raw_rx.recv() => notification,
                };
                let raw = match notification {
                    Some(Notification::Push(event)) => event,
                    Some(Notification::Poll(pod)) => RawPodEvent::Modified(pod),
                    Some(Notification::PushClosed) | None => {
                        debug!(pod = %pod_name, "Pod subscription ended");
                        break;
                    }
                };
                for event in translator.translate(raw) {
                    debug!(pod = %pod_name, kind = ?event.kind, container = ?event.container, "Pod event");
                    let sent = tokio::select! {
                        biased;
                        () = stop.cancelled() => break 'receive,
                        sent = out_tx.send(event) => sent,
                    };
                    if sent.is_err() {
                        break 'receive;
                    }
                }
                if translator.is_terminal() {
                    break;
                }
            }
            drop(out_tx);
            stop.cancel("watch closed");
        });

        Ok(PodWatch {
            events: out_rx,
            tasks,
        })
    }
}

impl std::fmt::Debug for PodWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodWatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
