//! Callback plumbing for interceptors and change listeners.
//!
//! Registries keep callbacks in registration order and dispatch over a
//! snapshot, so a callback may register or unregister others mid-dispatch
//! without invalidating the iteration; late registrations only see the next
//! event.

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::hash::GraphHashBuilder;

pub(crate) struct CallbackRegistry<F: ?Sized> {
    entries: Arc<RegistryEntries<F>>,
}

pub(crate) struct RegistryEntries<F: ?Sized> {
    slots: Mutex<IndexMap<u64, Arc<Mutex<Box<F>>>, GraphHashBuilder>>,
    next_token: AtomicU64,
}

impl<F: ?Sized> CallbackRegistry<F> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(RegistryEntries {
                slots: Mutex::new(IndexMap::with_hasher(GraphHashBuilder)),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.slots.lock().is_empty()
    }

    /// Register a callback; the returned [`Subscription`] unregisters it.
    pub(crate) fn add(&self, callback: Box<F>) -> Subscription
    where
        F: Send + 'static,
    {
        let token = self.entries.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries
            .slots
            .lock()
            .insert(token, Arc::new(Mutex::new(callback)));

        let entries: Weak<RegistryEntries<F>> = Arc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = entries.upgrade() {
                // shift_remove keeps the remaining callbacks in registration
                // order.
                entries.slots.lock().shift_remove(&token);
            }
        })
    }

    /// Copy of the callback list in registration order.
    pub(crate) fn snapshot(&self) -> SmallVec<[Arc<Mutex<Box<F>>>; 4]> {
        self.entries.slots.lock().values().cloned().collect()
    }
}

/// Handle for a registered interceptor or change listener.
///
/// Dropping the handle unregisters the callback; [`Subscription::dispose`]
/// does the same explicitly. Both are idempotent.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister the callback now.
    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}
