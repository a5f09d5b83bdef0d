//! Ordered, observable component collections.
//!
//! Sources, filters and recorders each live in a `Registry`: an ordered
//! collection supporting add/remove/indexed get/snapshot iteration that
//! notifies subscribers of membership changes. The pipeline subscribes to
//! attach or detach stages while running, without restarting anything else.
//!
//! Member type checking is carried by the type parameter; a
//! `Registry<CaptureSource>` can only ever hold capture sources.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// Membership change notification. Carries the affected member.
pub enum RegistryEvent<T: ?Sized> {
    Added(Arc<T>),
    Removed(Arc<T>),
}

struct RegistryInner<T: ?Sized> {
    items: Vec<Arc<T>>,
    subscribers: Vec<Sender<RegistryEvent<T>>>,
}

/// Ordered observable collection of shared members.
pub struct Registry<T: ?Sized> {
    inner: Mutex<RegistryInner<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                items: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Append a member and notify subscribers.
    pub fn add(&self, item: Arc<T>) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner.items.push(Arc::clone(&item));
        inner
            .subscribers
            .retain(|tx| tx.send(RegistryEvent::Added(Arc::clone(&item))).is_ok());
    }

    /// Remove a member by identity. Returns false when the member was not
    /// present. Subscribers are notified on success.
    pub fn remove(&self, item: &Arc<T>) -> bool {
        let mut inner = self.inner.lock().expect("registry lock");
        let Some(index) = inner.items.iter().position(|i| Arc::ptr_eq(i, item)) else {
            return false;
        };
        let removed = inner.items.remove(index);
        inner
            .subscribers
            .retain(|tx| tx.send(RegistryEvent::Removed(Arc::clone(&removed))).is_ok());
        true
    }

    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.inner
            .lock()
            .expect("registry lock")
            .items
            .get(index)
            .cloned()
    }

    /// Snapshot of the members in registration order.
    pub fn items(&self) -> Vec<Arc<T>> {
        self.inner.lock().expect("registry lock").items.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to membership changes. Events for members added before the
    /// subscription are not replayed; callers wire existing members from
    /// `items()` first.
    pub fn subscribe(&self) -> Receiver<RegistryEvent<T>> {
        let (tx, rx) = channel();
        self.inner
            .lock()
            .expect("registry lock")
            .subscribers
            .push(tx);
        rx
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
