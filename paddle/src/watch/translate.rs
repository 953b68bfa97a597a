//! Raw notification to lifecycle event translation.

use super::{WatchEvent, WatchEventKind};
use crate::cluster::{ContainerState, PodPhase, PodSnapshot, RawPodEvent};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Derives lifecycle events from raw pod notifications.
///
/// Owns the record of which containers have been seen running. Exactly one
/// translator exists per watched pod and every notification, pushed or
/// polled, goes through it.
#[derive(Debug, Default)]
pub struct PodEventTranslator {
    started: HashSet<String>,
    terminal: bool,
}

impl PodEventTranslator {
    /// Creates a translator with no containers recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once a terminal event has been produced.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Translates one notification. Nothing is produced after a terminal event.
    pub fn translate(&mut self, event: RawPodEvent) -> Vec<WatchEvent> {
        if self.terminal {
            return Vec::new();
        }
        match event {
            RawPodEvent::Added(pod) | RawPodEvent::Modified(pod) => self.translate_status(&pod),
            RawPodEvent::Deleted(pod) => {
                self.terminal = true;
                vec![WatchEvent::new(WatchEventKind::PodDeletedExternally, pod)]
            }
            RawPodEvent::Error(message) => {
                warn!(error = %message, "Pod watch reported an error");
                Vec::new()
            }
        }
    }

    fn translate_status(&mut self, pod: &PodSnapshot) -> Vec<WatchEvent> {
        match pod.phase {
            PodPhase::Succeeded => {
                debug!(pod = %pod.name, "Pod succeeded");
                self.terminal = true;
                return vec![WatchEvent::new(WatchEventKind::PodCompleted, pod.clone())];
            }
            PodPhase::Failed => {
                debug!(pod = %pod.name, "Pod failed");
                self.terminal = true;
                let mut event = WatchEvent::new(WatchEventKind::PodFailed, pod.clone());
                event.message.clone_from(&pod.message);
                return vec![event];
            }
            PodPhase::Pending | PodPhase::Running | PodPhase::Unknown => {}
        }

        let mut events = Vec::new();
        for status in &pod.container_statuses {
            match &status.state {
                ContainerState::Running => {
                    if self.started.insert(status.name.clone()) {
                        events.push(
                            WatchEvent::new(WatchEventKind::ContainerStarted, pod.clone())
                                .with_container(&status.name),
                        );
                    }
                }
                ContainerState::Terminated { exit_code, message } => {
                    if self.started.remove(&status.name) {
                        events.push(
                            WatchEvent::new(WatchEventKind::ContainerRemoved, pod.clone())
                                .with_container(&status.name),
                        );
                    }
                    if *exit_code != 0 {
                        let mut failed = WatchEvent::new(WatchEventKind::PodFailed, pod.clone())
                            .with_container(&status.name);
                        failed.message.clone_from(message);
                        events.push(failed);
                        self.terminal = true;
                        return events;
                    }
                }
                ContainerState::Waiting { .. } => {}
            }
        }
        events
    }
}
