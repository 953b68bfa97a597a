//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent - only the first cancellation reason is kept.
/// Async tasks wait on [`CancellationToken::cancelled`]; synchronous code
/// polls [`CancellationToken::is_cancelled`] or registers a callback.
#[derive(Default)]
pub struct CancellationToken {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    /// Callbacks to invoke on cancellation.
    callbacks: RwLock<Vec<CancelCallback>>,
    /// Child tokens still alive when last pruned.
    children: RwLock<Vec<Weak<CancellationToken>>>,
    /// Wakes tasks parked in `cancelled()`.
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a token that is cancelled whenever `self` is, with the same
    /// reason. Cancelling the child does not affect the parent.
    ///
    /// The parent holds only a weak reference; dropped children are
    /// pruned each time a new child is created.
    #[must_use]
    pub fn child(&self) -> Arc<Self> {
        let child = Self::new();
        {
            let callbacks = self.callbacks.read();
            if !self.is_cancelled() {
                let mut children = self.children.write();
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child));
                drop(callbacks);
                return child;
            }
        }
        child.cancel(self.reason().unwrap_or_default());
        child
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let (callbacks, children): (Vec<CancelCallback>, Vec<Weak<Self>>) = {
            // The flag and reason change under the callbacks lock so that
            // `on_cancel` never observes a half-cancelled token.
            let mut callbacks = self.callbacks.write();
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            *self.reason.write() = Some(reason.clone());
            (
                std::mem::take(&mut *callbacks),
                std::mem::take(&mut *self.children.write()),
            )
        };
        self.notify.notify_waiters();

        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason.as_str());
        }

        for callback in &callbacks {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&reason);
            })) {
                warn!("Cancellation callback panicked: {:?}", e);
            }
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        {
            let mut callbacks = self.callbacks.write();
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }

        let reason = self.reason().unwrap_or_default();
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(&reason);
        })) {
            warn!("Cancellation callback panicked: {:?}", e);
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Waits until cancellation is requested.
    ///
    /// Returns immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent
        // `cancel` cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
