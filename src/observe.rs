//! Push notification of state snapshots to UI observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Listener list shared by the registry and the URL cache.
pub(crate) struct Observers<T> {
    next_id: AtomicU64,
    listeners: Arc<Mutex<Vec<(u64, Listener<T>)>>>,
}

impl<T: 'static> Observers<T> {
    pub(crate) fn new() -> Self {
        Observers {
            next_id: AtomicU64::new(0),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(listener)));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(listeners) = listeners.upgrade() {
                    lock(&listeners).retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Deliver a snapshot to every listener. The list is copied first so a
    /// listener may unsubscribe while being notified.
    pub(crate) fn notify(&self, snapshot: &T) {
        let listeners: Vec<Listener<T>> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.listeners).is_empty()
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the listener attached;
/// call [`Subscription::unsubscribe`] to detach.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// Lock a std mutex, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
