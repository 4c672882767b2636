//! Synchronous listeners for device state changes.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::state::DeviceState;

type Callback = Arc<dyn Fn(&DeviceState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// Registered state listeners of one session
///
/// Callbacks run on the task that completed the command, while the session's
/// command lock is still held. They must not call back into the session.
#[derive(Default, Clone)]
pub struct ObserverRegistry {
    listeners: Arc<Mutex<Listeners>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(callback)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener with `state`, in registration order
    pub fn notify(&self, state: &DeviceState) {
        // Snapshot so a callback may register or unregister without deadlocking.
        let callbacks: Vec<Callback> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(state);
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Token returned by [`ObserverRegistry::register`]
///
/// Dropping it keeps the listener registered; call [`Subscription::unregister`]
/// to remove it.
#[derive(Debug)]
#[must_use = "dropping the subscription makes the listener impossible to remove"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unregister(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}
