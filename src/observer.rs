//! Observer-Listen mit Abmelde-Handles
//!
//! Jede Komponente, die Events auffächert, hält eine `Observers<T>` Liste.
//! `subscribe` gibt eine [`Subscription`] zurück, über die sich der Listener
//! wieder abmelden kann.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ListenerList<T> = Mutex<Vec<(u64, Listener<T>)>>;

/// Fan-out Liste von Listenern für Events vom Typ `T`
pub struct Observers<T> {
    next_id: AtomicU64,
    listeners: Arc<ListenerList<T>>,
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registriert einen Listener
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));

        let weak: Weak<ListenerList<T>> = Arc::downgrade(&self.listeners);
        Subscription {
            id,
            detach: Some(Box::new(move |id| {
                if let Some(list) = weak.upgrade() {
                    list.lock().retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Benachrichtigt alle Listener synchron.
    ///
    /// Die Liste wird vorher kopiert, damit Listener sich während der
    /// Benachrichtigung an- oder abmelden können.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle eines registrierten Listeners.
///
/// Drop meldet den Listener nicht ab, nur [`Subscription::unsubscribe`].
pub struct Subscription {
    id: u64,
    detach: Option<Box<dyn FnOnce(u64) + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Meldet den Listener ab
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
