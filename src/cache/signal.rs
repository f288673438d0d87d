//! Completion Signal Module
//!
//! A single-resolution, multi-subscriber completion handle. Loads,
//! flushes and in-flight sidecar writes each install one; callers that
//! arrive while the operation is running attach to it instead of
//! starting a duplicate.

use std::sync::Arc;

use tokio::sync::watch;

// == Signal ==
/// One-shot completion handle that any number of tasks can await.
///
/// The first `complete` wins; later calls are ignored. `wait` returns a
/// clone of the resolved value, immediately if resolution already
/// happened.
pub(crate) struct Signal<T: Clone> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> Signal<T> {
    // == Constructor ==
    /// Creates a new unresolved signal.
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    // == Complete ==
    /// Resolves the signal, waking every waiter. No-op if already resolved.
    pub(crate) fn complete(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        });
    }

    // == Wait ==
    /// Waits until the signal resolves and returns the resolved value.
    pub(crate) async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        // The sender lives inside self, so the channel cannot close
        // while a waiter holds a clone of this signal.
        let resolved = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("signal sender dropped while waiting");
        resolved
            .as_ref()
            .cloned()
            .expect("signal resolved without a value")
    }

    // == Is Resolved ==
    /// Returns true once `complete` has been called.
    #[allow(dead_code)]
    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl<T: Clone> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("resolved", &self.tx.borrow().is_some())
            .finish()
    }
}
