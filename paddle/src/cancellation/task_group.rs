//! Task group for the background tasks a single step owns.

use super::CancellationToken;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A group of related tasks bound to one cancellation token.
///
/// Every task receives the group's token and is expected to return once it
/// is cancelled. [`TaskGroup::shutdown`] cancels the token and joins every
/// task, so nothing the group spawned outlives it. Dropping the group
/// cancels the token as well.
pub struct TaskGroup {
    /// The cancellation token shared by all tasks.
    cancel_token: Arc<CancellationToken>,
    /// Handles to spawned tasks, with their names.
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskGroup {
    /// Creates a new task group driven by `cancel_token`.
    #[must_use]
    pub fn new(cancel_token: Arc<CancellationToken>) -> Self {
        Self {
            cancel_token,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Spawns a task in the group.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce(Arc<CancellationToken>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "Spawning task");
        let handle = tokio::spawn(task(self.cancel_token.clone()));
        self.handles.lock().push((name, handle));
    }

    /// Cancels the group's token and waits for every task to finish.
    pub async fn shutdown(&self, reason: &str) {
        self.cancel_token.cancel(reason);
        self.join().await;
    }

    /// Waits for every task spawned so far to finish.
    ///
    /// A handle leaves the group only once its task has finished, so a
    /// `join` abandoned mid-way (e.g. under a timeout) leaves the rest for
    /// a later `join` or `shutdown`.
    pub async fn join(&self) {
        loop {
            let Some(entry) = self.handles.lock().pop() else {
                return;
            };
            let mut pending = Pending {
                group: self,
                entry: Some(entry),
            };
            let result = match pending.entry.as_mut() {
                Some((_, handle)) => handle.await,
                None => continue,
            };
            if let (Some((name, _)), Err(join_error)) = (pending.entry.take(), result) {
                warn!(task = %name, error = %join_error, "Task did not complete cleanly");
            }
        }
    }

    /// Returns the number of tasks not yet joined.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }
}

/// A handle being awaited; returned to the group if the wait is dropped.
struct Pending<'a> {
    group: &'a TaskGroup,
    entry: Option<(String, JoinHandle<()>)>,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.group.handles.lock().push(entry);
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.cancel_token.cancel("task group dropped");
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("task_count", &self.task_count())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}
