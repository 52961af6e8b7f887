/// Typed event channels with explicit, idempotent unsubscription
///
/// An `Emitter<T>` delivers each fired event synchronously to the listeners
/// registered at the time of the call, in subscription order. Nothing is
/// buffered: a listener only sees events fired while it is subscribed.
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

pub struct Emitter<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener; it stays registered until the returned
    /// subscription is disposed or dropped
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut listeners = self.listeners.lock();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Listeners<T>>> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                let removed = {
                    let mut listeners = listeners.lock();
                    listeners
                        .entries
                        .iter()
                        .position(|(entry_id, _)| *entry_id == id)
                        .map(|index| listeners.entries.remove(index))
                };
                // Listener captures may own subscriptions themselves
                drop(removed);
            }
        })
    }

    pub fn fire(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    /// Resolves with the first event fired after this call
    /// Yields `None` if the emitter is cleared first
    pub fn next(&self) -> impl Future<Output = Option<T>> + Send + 'static
    where
        T: Clone + Send,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(move |event: &T| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.clone());
            }
        });

        async move {
            let event = rx.await.ok();
            drop(subscription);
            event
        }
    }

    /// Remove every listener
    pub fn clear(&self) {
        let drained = std::mem::take(&mut self.listeners.lock().entries);
        drop(drained);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener
/// Dropping it unsubscribes; use `detach` to keep the listener alive
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn dispose(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    /// Keep the listener registered for the emitter's lifetime
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
