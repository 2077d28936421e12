//! Callback registry with subscribe/unsubscribe tokens.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "dropping the token makes the callback impossible to remove"]
pub struct Subscription(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Shared by every set, so a token never matches a callback in another set.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A set of callbacks notified with events of type `E`.
pub struct ObserverSet<E> {
    observers: Mutex<Vec<(u64, Callback<E>)>>,
}

impl<E> Default for ObserverSet<E> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<E> ObserverSet<E> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(callback)));
        Subscription(id)
    }

    /// Remove a callback. Returns false if it was already removed.
    pub fn unsubscribe(&self, token: Subscription) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(id, _)| *id != token.0);
        observers.len() != before
    }

    /// Call every registered callback with `event`.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe.
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_notify_and_unsubscribe() {
        let set = ObserverSet::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&total);
        let token = set.subscribe(move |n| {
            counter.fetch_add(*n as usize, Ordering::SeqCst);
        });

        set.notify(&2);
        assert!(set.unsubscribe(token));
        assert!(!set.unsubscribe(token));
        set.notify(&5);

        assert_eq!(total.load(Ordering::SeqCst), 2);
        assert!(set.is_empty());
    }
}
