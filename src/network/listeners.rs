//! Ordered observer lists attached to device links.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Mutable, ordered set of observers for one device link.
///
/// Listeners are notified in registration order. Dispatch works on a snapshot,
/// so a listener may add or remove listeners (including itself) while it is
/// being notified.
pub struct ListenerRegistry<L: ?Sized> {
    name: &'static str,
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Creates an empty registry. `name` only appears in log output.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Creates a registry holding one initial listener.
    pub fn with_default(name: &'static str, default: Arc<L>) -> Self {
        Self {
            name,
            listeners: Mutex::new(vec![default]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<L>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a listener.
    pub fn add(&self, listener: Arc<L>) {
        let mut listeners = self.lock();
        listeners.push(listener);
        debug!(registry = self.name, count = listeners.len(), "listener added");
    }

    /// Removes the first entry pointing at the same object as `listener`.
    ///
    /// Returns false (and logs a warning) if it was not registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.lock();
        match listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(index) => {
                listeners.remove(index);
                debug!(registry = self.name, count = listeners.len(), "listener removed");
                true
            }
            None => {
                warn!(
                    registry = self.name,
                    "Tried to remove a listener that was not registered"
                );
                false
            }
        }
    }

    /// Returns true if `listener` is registered.
    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.lock().iter().any(|l| Arc::ptr_eq(l, listener))
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current listener list, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.lock().clone()
    }

    /// Calls `f` for every listener of the current snapshot, in order.
    pub fn for_each(&self, mut f: impl FnMut(&L)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }
}

impl<L: ?Sized> std::fmt::Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
